// vim: tw=80
//! The block I/O primitive underneath the RAID engine
//!
//! Physical disk drivers live outside of this crate.  They plug in by
//! implementing [`Disk`].  [`MemDisk`] is a RAM-backed implementation with
//! fault injection, used for simulation and testing.

use std::{
    pin::Pin,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    }
};

use futures::Future;
#[cfg(test)] use mockall::*;
use tokio::sync::watch;

use crate::{
    types::*,
    util::*,
};

/// Future representing an operation on a disk.
pub type DiskFut = dyn Future<Output = Result<()>> + Send;

/// Boxed `DiskFut`
pub type BoxDiskFut = Pin<Box<DiskFut>>;

/// A single physical disk, as seen by the RAID engine
///
/// Completion of the returned future is the driver's asynchronous completion
/// callback.  Implementations must not reorder a read and a write to the same
/// sector that are in flight at the same time; the engine never issues such a
/// pair anyway.
pub trait Disk: Send + Sync {
    /// Returns the "best" number of operations to queue to this `Disk`.  A
    /// smaller number may result in inefficient use of resources, or even
    /// starvation.  A larger number won't hurt, but won't accrue any economies
    /// of scale, either.
    fn optimum_queue_depth(&self) -> u32;

    /// Asynchronously read a contiguous portion of the disk.
    fn read_at(&self, buf: IoVecMut, sector: SectorT) -> BoxDiskFut;

    /// Usable size of the disk, in sectors
    fn size(&self) -> SectorT;

    /// Asynchronously write a contiguous portion of the disk.
    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut;
}

struct MemDiskInner {
    data: Mutex<Vec<u8>>,
    nsectors: SectorT,
    /// When set, every operation fails with `ENXIO`
    dead: AtomicBool,
    /// Number of upcoming operations that will fail with `EIO`
    transient: AtomicU32,
    /// While `true`, operations block before touching the data
    stall: watch::Sender<bool>,
    reads: AtomicU64,
    writes: AtomicU64,
    /// Starting sector of every read, in the order they were issued
    read_log: Mutex<Vec<SectorT>>,
    queue_depth: u32,
}

impl MemDiskInner {
    fn check_faults(&self) -> Result<()> {
        if self.dead.load(Ordering::Relaxed) {
            return Err(Error::ENXIO);
        }
        let r = self.transient.fetch_update(Ordering::Relaxed,
            Ordering::Relaxed, |n| n.checked_sub(1));
        if r.is_ok() {
            return Err(Error::EIO);
        }
        Ok(())
    }

    fn range(&self, sector: SectorT, len: usize)
        -> Result<std::ops::Range<usize>>
    {
        let start = sectors2bytes(sector);
        let end = start + len;
        if len % BYTES_PER_SECTOR != 0 {
            Err(Error::EINVAL)
        } else if end > sectors2bytes(self.nsectors) {
            Err(Error::ERANGE)
        } else {
            Ok(start..end)
        }
    }
}

/// A RAM-backed [`Disk`] with fault injection.
///
/// Clones share the same backing store, so a test can keep one handle for
/// itself while giving another to the volume.
#[derive(Clone)]
pub struct MemDisk {
    inner: Arc<MemDiskInner>
}

impl MemDisk {
    /// Read the disk's current contents, bypassing fault injection
    pub fn contents(&self, sector: SectorT, nsectors: SectorT) -> Vec<u8> {
        let data = self.inner.data.lock().unwrap();
        let start = sectors2bytes(sector);
        data[start..start + sectors2bytes(nsectors)].to_vec()
    }

    /// Complete the next `n` operations with `EIO`
    pub fn fail_next(&self, n: u32) {
        self.inner.transient.store(n, Ordering::Relaxed);
    }

    /// Overwrite the disk's contents, bypassing fault injection
    pub fn fill(&self, sector: SectorT, buf: &[u8]) {
        let mut data = self.inner.data.lock().unwrap();
        let start = sectors2bytes(sector);
        data[start..start + buf.len()].copy_from_slice(buf);
    }

    /// Fail every current and future operation with `ENXIO`
    pub fn kill(&self) {
        self.inner.dead.store(true, Ordering::Relaxed);
        self.inner.stall.send_replace(false);
    }

    /// Create a zero-filled disk
    pub fn new(nsectors: SectorT) -> Self {
        Self::with_queue_depth(nsectors, 8)
    }

    /// Starting sectors of every read issued so far, oldest first
    pub fn read_log(&self) -> Vec<SectorT> {
        self.inner.read_log.lock().unwrap().clone()
    }

    /// Create a zero-filled disk that prefers `queue_depth` operations in
    /// flight at once
    pub fn with_queue_depth(nsectors: SectorT, queue_depth: u32) -> Self {
        let (stall, _) = watch::channel(false);
        let inner = Arc::new(MemDiskInner {
            data: Mutex::new(vec![0u8; sectors2bytes(nsectors)]),
            nsectors,
            dead: AtomicBool::new(false),
            transient: AtomicU32::new(0),
            stall,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            read_log: Mutex::new(Vec::new()),
            queue_depth,
        });
        MemDisk{inner}
    }

    /// Number of reads that have completed successfully
    pub fn reads(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Let stalled operations proceed
    pub fn resume(&self) {
        self.inner.stall.send_replace(false);
    }

    /// Hold every subsequent operation until [`resume`](Self::resume)
    pub fn stall(&self) {
        self.inner.stall.send_replace(true);
    }

    /// Number of writes that have completed successfully
    pub fn writes(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

impl Disk for MemDisk {
    fn optimum_queue_depth(&self) -> u32 {
        self.inner.queue_depth
    }

    fn read_at(&self, mut buf: IoVecMut, sector: SectorT) -> BoxDiskFut {
        self.inner.read_log.lock().unwrap().push(sector);
        let inner = self.inner.clone();
        let mut stall = inner.stall.subscribe();
        Box::pin(async move {
            if stall.wait_for(|stalled| !*stalled).await.is_err() {
                return Err(Error::EPIPE);
            }
            inner.check_faults()?;
            let range = inner.range(sector, buf.len())?;
            {
                let data = inner.data.lock().unwrap();
                buf[..].copy_from_slice(&data[range]);
            }
            inner.reads.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn size(&self) -> SectorT {
        self.inner.nsectors
    }

    fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut {
        let inner = self.inner.clone();
        let mut stall = inner.stall.subscribe();
        Box::pin(async move {
            if stall.wait_for(|stalled| !*stalled).await.is_err() {
                return Err(Error::EPIPE);
            }
            inner.check_faults()?;
            let range = inner.range(sector, buf.len())?;
            {
                let mut data = inner.data.lock().unwrap();
                data[range].copy_from_slice(&buf[..]);
            }
            inner.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mock! {
    pub Disk {}
    impl Disk for Disk {
        fn optimum_queue_depth(&self) -> u32;
        fn read_at(&self, buf: IoVecMut, sector: SectorT) -> BoxDiskFut;
        fn size(&self) -> SectorT;
        fn write_at(&self, buf: IoVec, sector: SectorT) -> BoxDiskFut;
    }
}

// LCOV_EXCL_STOP
