// vim: tw=80
//! Reconstruction buffer accounting
//!
//! Each surviving unit read during reconstruction lands in one buffer, which
//! stays charged to the pool until its RU has been rebuilt.  Floating buffers
//! come from a bounded pool shared by the whole volume, and requesters sleep
//! in FIFO order while it is exhausted.  Forced buffers serve foreground
//! accesses and are never refused.

use divbuf::DivBufShared;
use futures::channel::oneshot;
use futures_locks::Mutex as AsyncMutex;
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use crate::{types::*, util::*};

/// Which budget a [`ReconBuffer`] is charged to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufferKind {
    /// Background reconstruction, limited by the pool's cap
    Floating,
    /// Reconstruction on behalf of a foreground access.  Uncapped.
    Forced,
}

#[derive(Debug)]
struct PoolInner {
    /// Maximum number of outstanding floating buffers
    cap: u32,
    floating: u32,
    forced: u32,
    /// Requesters waiting for a floating buffer
    sleepers: VecDeque<oneshot::Sender<()>>,
}

impl PoolInner {
    /// May another floating buffer be handed out?
    ///
    /// The caller must already hold the pool lock.
    fn check_floating_rbuf_count(&self) -> bool {
        debug_assert!(self.floating <= self.cap);
        self.floating < self.cap
    }
}

/// A volume-wide pool of reconstruction buffers
#[derive(Clone)]
pub struct ReconBufferPool {
    inner: Arc<Mutex<PoolInner>>,
    /// Serializes multi-buffer reservations, so that two requesters can't
    /// each hold part of what they need while waiting for the rest
    reserving: AsyncMutex<()>,
    /// Size of each buffer, one stripe unit
    sectors: SectorT,
}

impl ReconBufferPool {
    /// May another floating buffer be handed out right now?
    pub fn check_floating_rbuf_count(&self) -> bool {
        self.inner.lock().unwrap().check_floating_rbuf_count()
    }

    pub fn cap(&self) -> u32 {
        self.inner.lock().unwrap().cap
    }

    /// Number of floating buffers currently in use
    pub fn floating(&self) -> u32 {
        self.inner.lock().unwrap().floating
    }

    /// Number of forced buffers currently in use
    pub fn forced(&self) -> u32 {
        self.inner.lock().unwrap().forced
    }

    fn free_recon_buffer(&self, kind: BufferKind) {
        let mut guard = self.inner.lock().unwrap();
        match kind {
            BufferKind::Forced => guard.forced -= 1,
            BufferKind::Floating => {
                // Hand the buffer directly to the longest sleeper, if any
                while let Some(tx) = guard.sleepers.pop_front() {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    // That requester gave up
                }
                guard.floating -= 1;
            }
        }
    }

    /// Acquire a buffer.
    ///
    /// A floating buffer may have to wait for another to be freed.
    pub async fn make_recon_buffer(&self, kind: BufferKind) -> ReconBuffer {
        loop {
            let rx = {
                let mut guard = self.inner.lock().unwrap();
                match kind {
                    BufferKind::Forced => {
                        guard.forced += 1;
                        return self.wrap(kind);
                    }
                    BufferKind::Floating if guard.sleepers.is_empty() &&
                        guard.check_floating_rbuf_count() =>
                    {
                        guard.floating += 1;
                        return self.wrap(kind);
                    }
                    BufferKind::Floating => {
                        let (tx, rx) = oneshot::channel();
                        guard.sleepers.push_back(tx);
                        rx
                    }
                }
            };
            if rx.await.is_ok() {
                // The freer transferred its buffer to us
                return self.wrap(kind);
            }
        }
    }

    /// Acquire `n` buffers at once, or as many as the cap allows.
    ///
    /// Forced buffers are handed out immediately, even while a floating
    /// reservation is stuck at the cap.
    pub async fn make_recon_buffers(&self, kind: BufferKind, n: usize)
        -> Vec<ReconBuffer>
    {
        if kind == BufferKind::Forced {
            self.inner.lock().unwrap().forced += n as u32;
            return (0..n).map(|_| self.wrap(kind)).collect();
        }
        let n = n.min(self.cap() as usize);
        let _guard = self.reserving.lock().await;
        let mut bufs = Vec::with_capacity(n);
        for _ in 0..n {
            bufs.push(self.make_recon_buffer(kind).await);
        }
        bufs
    }

    pub fn new(cap: u32, sectors: SectorT) -> Self {
        let inner = PoolInner {
            cap: cap.max(1),
            floating: 0,
            forced: 0,
            sleepers: VecDeque::new(),
        };
        ReconBufferPool {
            inner: Arc::new(Mutex::new(inner)),
            reserving: AsyncMutex::new(()),
            sectors,
        }
    }

    /// Forget about everyone still waiting for a buffer.  They will retry and
    /// wait again, unless they've given up.
    pub fn release(&self) {
        self.inner.lock().unwrap().sleepers.clear();
    }

    fn wrap(&self, kind: BufferKind) -> ReconBuffer {
        let data = Some(zeroed_sectors(self.sectors));
        ReconBuffer{kind, pool: self.clone(), data}
    }
}

/// One unit's worth of reconstruction data.  Returned to the pool on drop.
pub struct ReconBuffer {
    kind: BufferKind,
    pool: ReconBufferPool,
    data: Option<DivBufShared>,
}

impl ReconBuffer {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Take the storage, to be read into.  The buffer stays charged to the
    /// pool until it is dropped.
    pub fn take(&mut self) -> Option<DivBufShared> {
        self.data.take()
    }
}

impl Drop for ReconBuffer {
    fn drop(&mut self) {
        self.pool.free_recon_buffer(self.kind);
    }
}

// LCOV_EXCL_STOP
