// vim: tw=80
//! Dual-parity RAID with rotating P and Q units

use crate::types::*;
use super::*;

/// P rotates like left-symmetric RAID-5 parity, Q sits immediately to its
/// right, and data units follow Q.
#[derive(Clone, Debug)]
pub struct Pq {
    geom: Geometry,
}

impl Pq {
    pub fn new(geom: Geometry) -> Result<Self> {
        if geom.num_col < 4 {
            return Err(Error::EINVAL);
        }
        Ok(Pq{geom})
    }
}

impl Layout for Pq {
    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, _remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        let n = u64::from(self.geom.num_col);
        let nd = self.num_data_col();
        let p = (n - 1) - (sid % n);
        let q = (p + 1) % n;
        let col = match unit.checked_sub(nd) {
            None => (q + 1 + u64::from(unit)) % n,
            Some(0) => p,
            Some(_) => q,
        };
        Ok(PhysAddr::new(col as ColT, sid * self.geom.sectors_per_su))
    }

    fn num_check_col(&self) -> u32 {
        2
    }

    fn num_data_col(&self) -> u32 {
        u32::from(self.geom.num_col) - 2
    }

    fn num_stripes(&self) -> StripeT {
        self.geom.rows()
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Pq
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use super::*;

    #[test]
    fn table() {
        let geom = Geometry{num_col: 5, sectors_per_su: 4, sectors_per_disk: 64};
        let layout = Pq::new(geom).unwrap();
        let expected = [
            [1, 2, 3, 4, 0],
            [0, 1, 2, 3, 4],
            [4, 0, 1, 2, 3],
        ];
        for (sid, row) in expected.iter().enumerate() {
            assert_eq!(layout.stripe_cols(sid as u64).unwrap(), row.to_vec());
        }
        assert_eq!(layout.map_q(13, false).unwrap(), Some(PhysAddr::new(4, 5)));
    }
}
// LCOV_EXCL_STOP
