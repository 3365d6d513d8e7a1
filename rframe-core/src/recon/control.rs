// vim: tw=80
//! Reconstruction control block

use fixedbitset::FixedBitSet;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};
use tokio::sync::Notify;

use crate::{
    config::ReconConfig,
    types::*,
};
use super::buffer::ReconBufferPool;

#[derive(Debug)]
struct Progress {
    /// Next stripe to be started
    cursor: StripeT,
    /// For each surviving column, stripes with reconstruction reads still
    /// outstanding on it
    outstanding: BTreeMap<ColT, BTreeSet<StripeT>>,
    /// Stripes whose lost unit is already on spare space
    rebuilt: FixedBitSet,
}

/// The part of a [`ReconControl`] that disk completions update
#[derive(Debug)]
pub(super) struct Tracker {
    progress: Mutex<Progress>,
    /// Signalled whenever a reconstruction read completes
    notify: Notify,
}

impl Tracker {
    /// A reconstruction read of stripe `sid` on column `col` completed
    pub(super) fn read_done(&self, col: ColT, sid: StripeT) {
        let mut guard = self.progress.lock().unwrap();
        if let Some(set) = guard.outstanding.get_mut(&col) {
            set.remove(&sid);
            if set.is_empty() {
                guard.outstanding.remove(&col);
            }
        }
        drop(guard);
        self.notify.notify_one();
    }
}

/// State of the rebuild of one failed column
pub struct ReconControl {
    /// The column being rebuilt
    col: ColT,
    /// The dedicated spare receiving its contents, if any
    spare: Option<ColT>,
    /// How far the cursor may lead the oldest outstanding read of any disk,
    /// in stripes
    head_sep_limit: StripeT,
    nstripes: StripeT,
    pool: ReconBufferPool,
    tracker: Arc<Tracker>,
}

impl ReconControl {
    /// Record that stripe `sid` is about to be rebuilt, reading from `cols`
    pub fn begin(&self, sid: StripeT, cols: &[ColT]) {
        let mut guard = self.tracker.progress.lock().unwrap();
        for col in cols {
            guard.outstanding.entry(*col).or_default().insert(sid);
        }
        guard.cursor = guard.cursor.max(sid + 1);
    }

    pub fn col(&self) -> ColT {
        self.col
    }

    /// Next stripe that background reconstruction will start
    pub fn cursor(&self) -> StripeT {
        self.tracker.progress.lock().unwrap().cursor
    }

    /// Forget any reads of stripe `sid` that are still recorded as
    /// outstanding
    pub fn finish(&self, sid: StripeT) {
        let mut guard = self.tracker.progress.lock().unwrap();
        guard.outstanding.retain(|_, set| {
            set.remove(&sid);
            !set.is_empty()
        });
        drop(guard);
        self.tracker.notify.notify_one();
    }

    pub fn head_sep_limit(&self) -> StripeT {
        self.head_sep_limit
    }

    pub fn is_rebuilt(&self, sid: StripeT) -> bool {
        self.tracker.progress.lock().unwrap().rebuilt.contains(sid as usize)
    }

    /// Create a control block for rebuilding `col` onto `spare`.
    ///
    /// `stripe_width` is the number of units per stripe.  It sizes the
    /// head-separation limit unless `config` overrides it.
    pub fn new(col: ColT, spare: Option<ColT>, nstripes: StripeT,
               stripe_width: u32, config: &ReconConfig, pool: ReconBufferPool)
        -> Self
    {
        let progress = Progress {
            cursor: 0,
            outstanding: BTreeMap::new(),
            rebuilt: FixedBitSet::with_capacity(nstripes as usize),
        };
        let tracker = Arc::new(Tracker {
            progress: Mutex::new(progress),
            notify: Notify::new(),
        });
        let head_sep_limit = StripeT::from(
            config.head_sep_limit(stripe_width).max(1));
        ReconControl{col, spare, head_sep_limit, nstripes, pool, tracker}
    }

    pub fn nstripes(&self) -> StripeT {
        self.nstripes
    }

    /// Number of stripes rebuilt so far
    pub fn nrebuilt(&self) -> usize {
        self.tracker.progress.lock().unwrap().rebuilt.count_ones(..)
    }

    /// May background reconstruction start stripe `sid`?
    ///
    /// Not if it would put the cursor more than the head separation limit
    /// ahead of the oldest outstanding read on any surviving disk.
    pub fn may_start(&self, sid: StripeT) -> bool {
        let guard = self.tracker.progress.lock().unwrap();
        guard.outstanding.values()
            .filter_map(BTreeSet::first)
            .all(|oldest| sid < oldest + self.head_sep_limit)
    }

    pub fn pool(&self) -> &ReconBufferPool {
        &self.pool
    }

    /// Wait until some reconstruction read or RU completes
    pub async fn progress(&self) {
        self.tracker.notify.notified().await
    }

    pub fn set_rebuilt(&self, sid: StripeT) {
        self.tracker.progress.lock().unwrap().rebuilt.insert(sid as usize);
    }

    pub fn spare(&self) -> Option<ColT> {
        self.spare
    }

    pub(super) fn tracker(&self) -> Arc<Tracker> {
        self.tracker.clone()
    }
}

// LCOV_EXCL_STOP
