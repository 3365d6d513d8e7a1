// vim: tw=80
//! Per-stripe exclusion
//!
//! Foreground writes and reconstruction of the same stripe must not overlap.
//! Reads may share a stripe with other reads.  Locks are hashed by physical
//! stripe ID into a fixed table, so unrelated stripes occasionally contend.

use futures_locks::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use itertools::Itertools;

use crate::types::*;

/// Default number of slots in the lock table
pub const DEFAULT_SLOTS: usize = 64;

/// Proof of access to one slot of a [`StripeLocks`] table
pub enum StripeGuard {
    Shared(RwLockReadGuard<()>),
    Exclusive(RwLockWriteGuard<()>),
}

pub struct StripeLocks {
    slots: Vec<RwLock<()>>,
}

impl StripeLocks {
    pub fn new(nslots: usize) -> Self {
        let slots = (0..nslots.max(1)).map(|_| RwLock::new(())).collect();
        StripeLocks{slots}
    }

    /// The distinct slots covering `psids`, in ascending order.
    ///
    /// Acquiring in a global order prevents deadlock between accesses that
    /// span several stripes.
    fn slots_for(&self, psids: &[StripeT]) -> Vec<usize> {
        let n = self.slots.len() as u64;
        psids.iter()
            .map(|psid| (psid % n) as usize)
            .sorted_unstable()
            .dedup()
            .collect()
    }

    /// Lock every stripe in `psids` for reading
    pub async fn read(&self, psids: &[StripeT]) -> Vec<StripeGuard> {
        let mut guards = Vec::new();
        for slot in self.slots_for(psids) {
            guards.push(StripeGuard::Shared(self.slots[slot].read().await));
        }
        guards
    }

    /// Lock every stripe in `psids` for writing
    pub async fn write(&self, psids: &[StripeT]) -> Vec<StripeGuard> {
        let mut guards = Vec::new();
        for slot in self.slots_for(psids) {
            guards.push(StripeGuard::Exclusive(self.slots[slot].write().await));
        }
        guards
    }
}

impl Default for StripeLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SLOTS)
    }
}

// LCOV_EXCL_STOP
