// vim: tw=80
//! Disk Queue
//!
//! Each member disk gets a two-class FIFO of pending operations plus the
//! machinery to issue them.  Operations are issued in FIFO order, high priority
//! first, whenever fewer than the disk's optimum number are in flight.
//! Reconstruction uses the low-priority class, and foreground accesses can
//! promote its entries when they need the same stripe.

use divbuf::DivBufInaccessible;
use futures::{
    Future,
    channel::oneshot,
    task::{Context, Poll}
};
use pin_project::pin_project;
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, RwLock, Weak},
};

use crate::{
    disk::*,
    types::*,
};

/// Which FIFO of a [`Queue`] an entry goes into
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Priority {
    High,
    Low,
}

/// Identifies the reconstruction unit an operation belongs to: a physical
/// stripe ID and the RU within it.
pub type QueueKey = (StripeT, RuT);

#[derive(Debug)]
enum Cmd {
    ReadAt(IoVecMut),
    WriteAt(IoVec),
}

/// Enough of a command to issue it again after a transient failure
enum Reissue {
    ReadAt(DivBufInaccessible),
    WriteAt(IoVec),
}

impl Reissue {
    fn issue(&self, disk: &dyn Disk, sector: SectorT) -> Option<BoxDiskFut> {
        match self {
            // The previous attempt's buffer must already be dropped
            Reissue::ReadAt(dbi) => dbi.try_mut()
                .ok()
                .map(|buf| disk.read_at(buf, sector)),
            Reissue::WriteAt(iovec) => Some(disk.write_at(iovec.clone(), sector))
        }
    }
}

/// One disk-level request dispatched from a DAG node
#[derive(Debug)]
pub struct DiskQueueData {
    cmd: Cmd,
    /// Disk sector of the first byte
    pub sector: SectorT,
    /// Used for promotion matching
    pub key: QueueKey,
    sender: oneshot::Sender<Result<()>>,
}

impl DiskQueueData {
    pub fn read_at(buf: IoVecMut, sector: SectorT, key: QueueKey,
                   sender: oneshot::Sender<Result<()>>) -> Self
    {
        DiskQueueData{cmd: Cmd::ReadAt(buf), sector, key, sender}
    }

    pub fn write_at(buf: IoVec, sector: SectorT, key: QueueKey,
                    sender: oneshot::Sender<Result<()>>) -> Self
    {
        DiskQueueData{cmd: Cmd::WriteAt(buf), sector, key, sender}
    }

    pub fn is_read(&self) -> bool {
        matches!(self.cmd, Cmd::ReadAt(_))
    }

    /// Complete the request without issuing it
    fn abort(self, e: Error) {
        // The requester may have lost interest
        let _ = self.sender.send(Err(e));
    }
}

/// A prioritized pair of FIFOs
///
/// Order is preserved within each class, except as changed by
/// [`promote`](Self::promote).  The queue never rejects work.
#[derive(Debug, Default)]
pub struct Queue {
    hq: VecDeque<DiskQueueData>,
    lq: VecDeque<DiskQueueData>,
}

impl Queue {
    /// Remove and return the head of the high-priority FIFO, or failing that
    /// of the low-priority one.
    pub fn dequeue(&mut self) -> Option<DiskQueueData> {
        self.hq.pop_front().or_else(|| self.lq.pop_front())
    }

    /// Append an entry to the tail of the selected FIFO
    pub fn enqueue(&mut self, entry: DiskQueueData, pri: Priority) {
        match pri {
            Priority::High => self.hq.push_back(entry),
            Priority::Low => self.lq.push_back(entry),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.hq.is_empty() && self.lq.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hq.len() + self.lq.len()
    }

    /// Inspect the entry that `dequeue` would return next
    pub fn peek(&self) -> Option<&DiskQueueData> {
        self.hq.front().or_else(|| self.lq.front())
    }

    /// Move every low-priority entry for `psid`'s RU `which_ru` to the head of
    /// the high-priority FIFO, preserving their relative order.
    ///
    /// Returns the number of entries moved.
    pub fn promote(&mut self, psid: StripeT, which_ru: RuT) -> usize {
        let key = (psid, which_ru);
        let (matched, rest): (VecDeque<_>, VecDeque<_>) =
            self.lq.drain(..).partition(|e| e.key == key);
        self.lq = rest;
        let n = matched.len();
        for e in matched.into_iter().rev() {
            self.hq.push_front(e);
        }
        n
    }
}

struct Inner {
    disk: Arc<dyn Disk>,

    /// Transient failures to retry before giving up on an operation
    max_retries: u32,

    /// Max commands that will be simultaneously issued to the `Disk`
    optimum_queue_depth: u32,

    /// Current number of issued commands
    queue_depth: u32,

    queue: Queue,

    /// If Some, then the queue is being torn down.  Once nothing remains in
    /// flight, notify the Sender.
    remover: Option<oneshot::Sender<()>>,

    /// A `Weak` pointer back to `self`.  Used for closures that require a
    /// reference to `self`, but also require `'static` lifetime.
    weakself: Weak<RwLock<Inner>>
}

impl Inner {
    /// Issue as many queued operations as the disk can usefully take
    fn issue_all(&mut self, cx: &mut Context) {
        if self.remover.is_some() {
            while let Some(op) = self.queue.dequeue() {
                op.abort(Error::ENXIO);
            }
        }
        while self.queue_depth < self.optimum_queue_depth {
            let Some(op) = self.queue.dequeue() else {
                break;
            };
            self.issue_op(op, cx);
        }
        if self.queue_depth == 0 {
            if let Some(remover) = self.remover.take() {
                let _ = remover.send(());
            }
        }
        // If queue depth was exceeded, an operation's completion will call
        // issue_all again.
    }

    /// Immediately issue one operation.
    fn issue_op(&mut self, op: DiskQueueData, cx: &mut Context) {
        let sector = op.sector;
        let (mut fut, reissue) = match op.cmd {
            Cmd::ReadAt(buf) => {
                let dbi = buf.clone_inaccessible();
                (self.disk.read_at(buf, sector), Reissue::ReadAt(dbi))
            },
            Cmd::WriteAt(buf) => {
                let retained = buf.clone();
                (self.disk.write_at(buf, sector), Reissue::WriteAt(retained))
            }
        };
        let sender = op.sender;
        self.queue_depth += 1;

        // Poll once before spawning, so that synchronous completions are
        // handled synchronously.
        let first = match fut.as_mut().poll(cx) {
            Poll::Ready(r) if !self.should_retry(r, 0) => {
                let _ = sender.send(r);
                self.queue_depth -= 1;
                return;
            }
            Poll::Ready(r) => Some(r),
            Poll::Pending => None,
        };

        let Some(inner) = self.weakself.upgrade() else {
            // Can't happen while the caller holds the lock through an Arc
            let _ = sender.send(Err(Error::EPIPE));
            self.queue_depth -= 1;
            return;
        };
        let disk = self.disk.clone();
        let max_retries = self.max_retries;
        let schfut = self.reschedule();
        tokio::spawn( async move {
            let mut r = match first {
                Some(r) => {
                    // Release the buffer for reissue
                    drop(fut);
                    r
                },
                None => fut.await
            };
            let mut attempts = 0;
            while attempts < max_retries {
                let e = match r {
                    Err(e) if e.is_transient() => e,
                    _ => break
                };
                attempts += 1;
                tracing::warn!(sector, attempt = attempts, error = ?e,
                               "Retrying disk operation");
                r = match reissue.issue(&*disk, sector) {
                    Some(f) => f.await,
                    None => break
                };
            }
            let _ = sender.send(r);
            inner.write().unwrap().queue_depth -= 1;
            schfut.await
        });
    }

    /// Create a future which, when polled, will advance the scheduler,
    /// issuing more disk ops if any are waiting.
    fn reschedule(&self) -> ReschedFut {
        ReschedFut(self.weakself.clone())
    }

    /// Schedule the `op`, and try to issue it
    fn sched_and_issue(&mut self, op: DiskQueueData, pri: Priority,
                       cx: &mut Context)
    {
        self.queue.enqueue(op, pri);
        self.issue_all(cx);
    }

    fn should_retry(&self, r: Result<()>, attempts: u32) -> bool {
        match r {
            Err(e) => e.is_transient() && attempts < self.max_retries,
            Ok(()) => false
        }
    }
}

struct ReschedFut(Weak<RwLock<Inner>>);

impl Future for ReschedFut {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        if let Some(inner) = self.0.upgrade() {
            inner.write().unwrap().issue_all(cx);
        }
        Poll::Ready(())
    }
}

/// Return type of [`DiskQueue::read_at`] and [`DiskQueue::write_at`]
///
/// The operation is queued on first poll.
#[pin_project]
pub struct DiskQueueFut {
    op: Option<(DiskQueueData, Priority)>,
    inner: Arc<RwLock<Inner>>,
    #[pin]
    receiver: oneshot::Receiver<Result<()>>,
}

impl Future for DiskQueueFut {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let pinned = self.project();
        if let Some((op, pri)) = pinned.op.take() {
            pinned.inner.write().unwrap().sched_and_issue(op, pri, cx);
        }
        match pinned.receiver.poll(cx) {
            Poll::Ready(Ok(Ok(()))) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::EPIPE)),
            Poll::Ready(Ok(Err(e))) => Poll::Ready(Err(e))
        }
    }
}

/// Return type of [`DiskQueue::remove`]
#[pin_project]
pub struct RemoveFut {
    inner: Arc<RwLock<Inner>>,
    #[pin]
    receiver: oneshot::Receiver<()>,
    sender: Option<oneshot::Sender<()>>
}

impl Future for RemoveFut {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let pinned = self.project();
        if let Some(sender) = pinned.sender.take() {
            let mut guard = pinned.inner.write().unwrap();
            if guard.remover.replace(sender).is_some() {
                tracing::warn!("Disk queue removed twice");
            }
            guard.issue_all(cx);
        }
        match pinned.receiver.poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A scheduled [`Disk`]
///
/// Operations may not be issued immediately, and low-priority operations may
/// wait behind any number of high-priority ones.  Clones share the same
/// queue.
#[derive(Clone)]
pub struct DiskQueue {
    inner: Arc<RwLock<Inner>>,
    size: SectorT,
}

impl DiskQueue {
    /// Number of operations queued or in flight
    pub fn load(&self) -> usize {
        let guard = self.inner.read().unwrap();
        guard.queue.len() + guard.queue_depth as usize
    }

    pub fn new(disk: Arc<dyn Disk>, max_retries: u32) -> Self {
        let size = disk.size();
        let optimum_queue_depth = disk.optimum_queue_depth().max(1);
        let inner = Arc::new_cyclic(|weakself| RwLock::new(Inner {
            disk,
            max_retries,
            optimum_queue_depth,
            queue_depth: 0,
            queue: Queue::default(),
            remover: None,
            weakself: weakself.clone(),
        }));
        DiskQueue{inner, size}
    }

    fn new_fut(&self, op: DiskQueueData, pri: Priority,
               receiver: oneshot::Receiver<Result<()>>) -> DiskQueueFut
    {
        DiskQueueFut {
            op: Some((op, pri)),
            inner: self.inner.clone(),
            receiver
        }
    }

    /// Move queued reconstruction reads for the given RU ahead of everything
    /// else.  Returns the number of entries moved.
    pub fn promote(&self, psid: StripeT, which_ru: RuT) -> usize {
        self.inner.write().unwrap().queue.promote(psid, which_ru)
    }

    /// Asynchronously read a contiguous portion of the disk
    pub fn read_at(&self, buf: IoVecMut, sector: SectorT, pri: Priority,
                   key: QueueKey) -> DiskQueueFut
    {
        let (sender, receiver) = oneshot::channel::<Result<()>>();
        let op = DiskQueueData::read_at(buf, sector, key, sender);
        self.new_fut(op, pri, receiver)
    }

    /// Stop issuing new operations.
    ///
    /// Queued operations complete with `ENXIO`, and so does anything queued
    /// later.  The returned future completes once all in-flight operations
    /// have.
    pub fn remove(&self) -> RemoveFut {
        let (sender, receiver) = oneshot::channel();
        RemoveFut {
            inner: self.inner.clone(),
            receiver,
            sender: Some(sender),
        }
    }

    /// Usable size of the underlying disk, in sectors
    pub fn size(&self) -> SectorT {
        self.size
    }

    /// Asynchronously write a contiguous portion of the disk
    pub fn write_at(&self, buf: IoVec, sector: SectorT, pri: Priority,
                    key: QueueKey) -> DiskQueueFut
    {
        let (sender, receiver) = oneshot::channel::<Result<()>>();
        let op = DiskQueueData::write_at(buf, sector, key, sender);
        self.new_fut(op, pri, receiver)
    }
}

// LCOV_EXCL_STOP
