// vim: tw=80
//! Declustered dual-parity layout
//!
//! Stripes narrower than the array are spread over all of its disks by a
//! [`PrimeS`] block design, so a rebuild reads only a fraction of each
//! surviving disk.  Optionally, each iteration of the design is followed by a
//! row of spare units, giving every stripe one relocation target outside of
//! itself.

use crate::types::*;
use super::{
    *,
    prime_s::PrimeS,
};

#[derive(Clone, Debug)]
pub struct DeclusteredPq {
    geom: Geometry,
    locator: PrimeS,
    /// Disks per stripe
    k: u32,
    distributed_spare: bool,
    stripes: StripeT,
}

impl DeclusteredPq {
    /// Create a declustered layout.  `geom.num_col` must be prime, and with a
    /// distributed spare `disks_per_stripe` must be less than it.
    pub fn new(geom: Geometry, disks_per_stripe: i16, distributed_spare: bool)
        -> Result<Self>
    {
        let n = i16::try_from(geom.num_col).map_err(|_| Error::EINVAL)?;
        if disks_per_stripe < 3 ||
            (distributed_spare && disks_per_stripe >= n)
        {
            return Err(Error::EINVAL);
        }
        let locator = PrimeS::new(n, disks_per_stripe, 2)?;
        let k = disks_per_stripe as u32;
        let mut this = DeclusteredPq {geom, locator, k, distributed_spare,
                                      stripes: 0};
        this.stripes = this.count_stripes();
        Ok(this)
    }

    /// Count the stripes whose iterations fit entirely on the disks.
    fn count_stripes(&self) -> StripeT {
        let rows = self.geom.rows();
        let iter_rows = u64::from(self.rows_per_iteration());
        let iters_per_rep = u64::from(self.geom.num_col) - 1;
        let rep_rows = iters_per_rep * iter_rows;
        let stripes_per_iter = u64::from(self.locator.stripes_per_iteration());
        let reps = rows / rep_rows;
        let partial_iters = (rows % rep_rows) / iter_rows;
        (reps * iters_per_rep + partial_iters) * stripes_per_iter
    }

    /// Physical row of a chunk, given its offset in the block design
    fn design2row(&self, offset: u64) -> u64 {
        if !self.distributed_spare {
            return offset;
        }
        let k = u64::from(self.k);
        let depth = u64::from(self.locator.depth());
        let rep = offset / depth;
        let iter = (offset % depth) / k;
        self.iteration_base(rep, iter) + (offset % depth) % k
    }

    /// First physical row of an iteration
    fn iteration_base(&self, rep: u64, iter: u64) -> u64 {
        let n = u64::from(self.geom.num_col);
        let iter_rows = u64::from(self.rows_per_iteration());
        rep * (n - 1) * iter_rows + iter * iter_rows
    }

    fn rows_per_iteration(&self) -> u32 {
        self.locator.iteration_depth() + u32::from(self.distributed_spare)
    }
}

impl Layout for DeclusteredPq {
    fn distributed_spare(&self) -> bool {
        self.distributed_spare
    }

    fn geometry(&self) -> &Geometry {
        &self.geom
    }

    fn map_unit(&self, sid: StripeT, unit: u32, remap: bool)
        -> Result<PhysAddr>
    {
        check_unit(self, sid, unit)?;
        let spu = self.geom.sectors_per_su;
        if remap && self.distributed_spare {
            // Checked in the constructor: k < n
            let disk = self.locator.outside_disk(sid).ok_or(Error::EINVAL)?;
            let (rep, iter) = self.locator.stripe2iter(sid);
            let row = self.iteration_base(rep, u64::from(iter)) +
                u64::from(self.k);
            return Ok(PhysAddr::new(disk, row * spu));
        }
        let (disk, offset) = self.locator.locate(sid, unit);
        Ok(PhysAddr::new(disk, self.design2row(offset) * spu))
    }

    fn map_sid_to_psid(&self, sid: StripeT) -> (StripeT, RuT) {
        if self.distributed_spare {
            let n = u64::from(self.geom.num_col);
            (sid + sid / n, (sid % n) as RuT)
        } else {
            (sid, 0)
        }
    }

    fn num_check_col(&self) -> u32 {
        2
    }

    fn num_data_col(&self) -> u32 {
        self.k - 2
    }

    fn num_stripes(&self) -> StripeT {
        self.stripes
    }

    fn redundancy(&self) -> Redundancy {
        Redundancy::Pq
    }
}

// LCOV_EXCL_STOP
