// vim: tw=80
//! RAID level 0: striping without redundancy

use crate::types::*;
use super::*;

/// Plain striping across every column
#[derive(Clone, Debug)]
pub struct Nonredundant {
    geom: Geometry,
}

impl Nonredundant {
    pub fn new(geom: Geometry) -> Result<Self> {
        Ok(Nonredundant{geom})
    }
}

impl Layout for Nonredundant {
    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, _remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        Ok(PhysAddr::new(unit as ColT, sid * self.geom.sectors_per_su))
    }

    fn num_check_col(&self) -> u32 {
        0
    }

    fn num_data_col(&self) -> u32 {
        u32::from(self.geom.num_col)
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::None
    }
}

// LCOV_EXCL_STOP
