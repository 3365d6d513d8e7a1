// vim: tw=80
//! RAID level 1: mirrored pairs

use crate::types::*;
use super::*;

/// Columns are grouped into pairs `(2i, 2i + 1)`, each holding identical data.
/// Consecutive stripes rotate among the pairs.
#[derive(Clone, Debug)]
pub struct Mirror {
    geom: Geometry,
}

impl Mirror {
    pub fn new(geom: Geometry) -> Result<Self> {
        if geom.num_col < 2 || geom.num_col % 2 != 0 {
            return Err(Error::EINVAL);
        }
        Ok(Mirror{geom})
    }

    fn npairs(&self) -> u64 {
        u64::from(self.geom.num_col / 2)
    }
}

impl Layout for Mirror {
    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, _remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        let pair = sid % self.npairs();
        let row = sid / self.npairs();
        let col = (2 * pair) as ColT + unit as ColT;
        Ok(PhysAddr::new(col, row * self.geom.sectors_per_su))
    }

    fn num_check_col(&self) -> u32 {
        1
    }

    fn num_data_col(&self) -> u32 {
        1
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows() * self.npairs()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Mirror
    }
}

// LCOV_EXCL_STOP
