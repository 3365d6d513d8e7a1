// vim: tw=80
//! RAID level 5 with a rotating distributed spare

use crate::types::*;
use super::{*, raid5::left_symmetric};

/// Every row of stripe units holds one spare unit, rotating right to left.
/// The remaining `n - 1` units form a left-symmetric RAID-5 stripe.
#[derive(Clone, Debug)]
pub struct Raid5RotatedSpare {
    geom: Geometry,
}

impl Raid5RotatedSpare {
    pub fn new(geom: Geometry) -> Result<Self> {
        if geom.num_col < 4 {
            return Err(Error::EINVAL);
        }
        Ok(Raid5RotatedSpare{geom})
    }

    fn spare_col(&self, sid: StripeT) -> ColT {
        let n = u64::from(self.geom.num_col);
        ((n - 1) - (sid % n)) as ColT
    }
}

impl Layout for Raid5RotatedSpare {
    fn distributed_spare(&self) -> bool {
        true
    }

    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        let sector = sid * self.geom.sectors_per_su;
        let sc = self.spare_col(sid);
        if remap {
            return Ok(PhysAddr::new(sc, sector));
        }
        let nv = u64::from(self.geom.num_col) - 1;
        let v = left_symmetric(nv, sid, unit, self.num_data_col()) as ColT;
        let col = if v < sc { v } else { v + 1 };
        Ok(PhysAddr::new(col, sector))
    }

    fn num_check_col(&self) -> u32 {
        1
    }

    fn num_data_col(&self) -> u32 {
        u32::from(self.geom.num_col) - 2
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Parity
    }
}

// LCOV_EXCL_STOP
