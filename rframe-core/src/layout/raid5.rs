// vim: tw=80
//! Single-parity layouts: RAID level 4 and left-symmetric RAID level 5

use crate::types::*;
use super::*;

fn check_geom(geom: &Geometry) -> Result<()> {
    if geom.num_col < 3 {
        Err(Error::EINVAL)
    } else {
        Ok(())
    }
}

/// Left-symmetric placement of unit `unit` of stripe `sid` across `n` columns.
///
/// Parity starts on the last column and moves one column left on each
/// stripe.  Data units follow the parity unit, wrapping around.
pub(super) fn left_symmetric(n: u64, sid: StripeT, unit: u32, nd: u32) -> u64 {
    if unit < nd {
        (sid * (n - 1) + u64::from(unit)) % n
    } else {
        (n - 1) - (sid % n)
    }
}

/// Dedicated parity column
#[derive(Clone, Debug)]
pub struct Raid4 {
    geom: Geometry,
}

impl Raid4 {
    pub fn new(geom: Geometry) -> Result<Self> {
        check_geom(&geom)?;
        Ok(Raid4{geom})
    }
}

impl Layout for Raid4 {
    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, _remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        // The parity unit is the last one, and so is the parity column
        Ok(PhysAddr::new(unit as ColT, sid * self.geom.sectors_per_su))
    }

    fn num_check_col(&self) -> u32 {
        1
    }

    fn num_data_col(&self) -> u32 {
        u32::from(self.geom.num_col) - 1
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Parity
    }
}

/// Rotating parity, left-symmetric
#[derive(Clone, Debug)]
pub struct Raid5 {
    geom: Geometry,
}

impl Raid5 {
    pub fn new(geom: Geometry) -> Result<Self> {
        check_geom(&geom)?;
        Ok(Raid5{geom})
    }
}

impl Layout for Raid5 {
    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, _remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        let n = u64::from(self.geom.num_col);
        let col = left_symmetric(n, sid, unit, self.num_data_col());
        Ok(PhysAddr::new(col as ColT, sid * self.geom.sectors_per_su))
    }

    fn num_check_col(&self) -> u32 {
        1
    }

    fn num_data_col(&self) -> u32 {
        u32::from(self.geom.num_col) - 1
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Parity
    }
}

// LCOV_EXCL_STOP
