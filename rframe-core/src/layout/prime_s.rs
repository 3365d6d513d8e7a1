// vim: tw=80
//! PRIME-S block design
//!
//! PRIME[^PRIME_] spreads stripes of `k` units over `n` disks, `n` prime, so
//! that every pair of disks shares the same number of stripes.  PRIME-S keeps
//! its disk function but replaces the offset function with one that stores
//! each disk's units in increasing order of logical address.
//!
//! Terminology:
//!
//! - `n`: disks in the array
//! - `k`: units per stripe, `m` data and `f` check
//! - `y`: stride, `z`: iteration.  An iteration places `n` stripes on `k` rows
//!   of every disk, and a repetition is `n - 1` iterations, one per stride.
//!
//! [^PRIME_]: Alvarez, Guillermo A., et al. "Declustered disk array
//! architectures with optimal and near-optimal parallelism." ACM SIGARCH
//! Computer Architecture News. Vol. 26. No. 3. IEEE Computer Society, 1998.

use crate::types::*;

/// Largest disk count that keeps every intermediate value within 32 bits
pub const MAX_DISKS: i16 = 211;

/// Multiplicative inverse of `a` mod `n`, by the extended Euclidean
/// algorithm.  `n` must be prime.
fn invmod(a: i32, n: i32) -> i32 {
    let (mut t, mut newt) = (0i32, 1i32);
    let (mut r, mut newr) = (n, a.rem_euclid(n));
    while newr > 0 {
        let q = r / newr;
        (t, newt) = (newt, t - q * newt);
        (r, newr) = (newr, r - q * newr);
    }
    debug_assert_eq!(r, 1, "{a} is not invertible mod {n}");
    t.rem_euclid(n)
}

/// Trial division.  Only used at construction time.
pub fn is_prime(n: i16) -> bool {
    let n = i32::from(n);
    n >= 2 && (2..).take_while(|d| d * d <= n).all(|d| n % d != 0)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PrimeS {
    n: i32,
    k: i32,
    /// Data units per stripe
    m: i32,
    /// Inverse of `m`, mod `n`
    m_inv: i32,
    /// Check units per stripe
    f: i32,
}

impl PrimeS {
    /// `num_disks` must be prime, and at least `disks_per_stripe`.
    /// `redundancy` units of every stripe hold check data.
    pub fn new(num_disks: i16, disks_per_stripe: i16, redundancy: i16)
        -> Result<Self>
    {
        if !is_prime(num_disks) || num_disks > MAX_DISKS ||
            disks_per_stripe <= 1 || disks_per_stripe > num_disks ||
            redundancy <= 0 || redundancy >= disks_per_stripe
        {
            return Err(Error::EINVAL);
        }
        let n = i32::from(num_disks);
        let k = i32::from(disks_per_stripe);
        let f = i32::from(redundancy);
        let m = k - f;
        Ok(PrimeS{n, k, m, m_inv: invmod(m, n), f})
    }

    /// Rows of each disk in one repetition of the design
    pub fn depth(&self) -> u32 {
        (self.k * (self.n - 1)) as u32
    }

    /// Rows of each disk in one iteration
    pub fn iteration_depth(&self) -> u32 {
        self.k as u32
    }

    /// Disk and row of unit `pos` of `stripe`.  Data units come first, then
    /// check units.
    pub fn locate(&self, stripe: StripeT, pos: u32) -> (ColT, u64) {
        debug_assert!((pos as i32) < self.k);
        let (rep, s) = self.split(stripe);
        let b = pos as i32;
        let z = s / self.n;
        let y = z % (self.n - 1) + 1;
        let disk = ((s * self.m + b) * y).rem_euclid(self.n);

        // Data units of earlier stripes in this repetition that landed on this
        // disk, plus the check units of earlier iterations
        let mut row = (s * self.m + b) / self.n + self.f * z;
        // plus check units of earlier stripes in this iteration
        let y_inv = invmod(y, self.n);
        row += (0..self.f)
            .filter(|j| {
                let owner = ((disk * y_inv - j) * self.m_inv - 1)
                    .rem_euclid(self.n);
                s % self.n > owner
            }).count() as i32;
        (disk as ColT, rep * u64::from(self.depth()) + row as u64)
    }

    /// The disk at virtual position `k` of `stripe`.
    ///
    /// The disk function permutes the `n` virtual positions of a stripe over
    /// the `n` disks, and only positions `[0, k)` hold units.  So when `k < n`
    /// this disk holds nothing of the stripe, and over one iteration every
    /// disk plays this role for exactly one stripe.
    pub fn outside_disk(&self, stripe: StripeT) -> Option<ColT> {
        if self.k >= self.n {
            return None;
        }
        let (_, s) = self.split(stripe);
        let y = (s / self.n) % (self.n - 1) + 1;
        Some(((s * self.m + self.k) * y).rem_euclid(self.n) as ColT)
    }

    /// Repetition of `stripe`, and its index within the repetition
    fn split(&self, stripe: StripeT) -> (u64, i32) {
        let per_rep = u64::from(self.stripes_per_iteration()) *
            (self.n as u64 - 1);
        (stripe / per_rep, (stripe % per_rep) as i32)
    }

    /// Repetition of a stripe, and its iteration within the repetition
    pub fn stripe2iter(&self, stripe: StripeT) -> (u64, u32) {
        let (rep, s) = self.split(stripe);
        (rep, (s / self.n) as u32)
    }

    pub fn stripes_per_iteration(&self) -> u32 {
        self.n as u32
    }
}

// LCOV_EXCL_STOP
