// vim: tw=80
//! Reconstruction Controller
//!
//! Rebuilds a failed column onto spare space, one RU at a time in stripe
//! order, while foreground I/O continues.  Reconstruction reads use the
//! low-priority class of each Disk Queue, so foreground accesses overtake
//! them, and can promote them when they need the same stripe.

use futures::{
    FutureExt,
    StreamExt,
    future::{self, Either},
    stream::FuturesUnordered,
};
use std::{pin::pin, sync::Arc};

use crate::{
    asm::AccessStripeMap,
    dag::*,
    disk::BoxDiskFut,
    disk_queue::{DiskQueue, Priority, QueueKey},
    layout::{Layout, LayoutImpl},
    stripe_lock::StripeLocks,
    types::*,
};

mod buffer;
mod control;

pub use self::buffer::{BufferKind, ReconBuffer, ReconBufferPool};
pub use self::control::ReconControl;
use self::control::Tracker;

/// The volume services that reconstruction relies on
pub trait ReconHost: Sync {
    fn build_ctx(&self) -> BuildCtx<'_>;

    /// Escalate a disk error during reconstruction.  Fails if the volume can
    /// no longer tolerate the loss.
    fn fail_disk(&self, col: ColT) -> Result<()>;

    fn layout(&self) -> &LayoutImpl;

    fn locks(&self) -> &StripeLocks;

    /// Map a whole stripe, with the current health of each of its units
    fn map_stripe(&self, sid: StripeT) -> Result<AccessStripeMap>;

    fn queues(&self) -> &[DiskQueue];
}

/// Disk Queue access that keeps a [`ReconControl`] informed of read
/// completions
struct ReconIo<'a> {
    queues: &'a [DiskQueue],
    tracker: Arc<Tracker>,
    sid: StripeT,
}

impl DagIo for ReconIo<'_> {
    fn read_at(&self, col: ColT, buf: IoVecMut, sector: SectorT,
               pri: Priority, key: QueueKey) -> BoxDiskFut
    {
        let tracker = self.tracker.clone();
        let sid = self.sid;
        let fut = self.queues.read_at(col, buf, sector, pri, key);
        Box::pin(fut.inspect(move |_| tracker.read_done(col, sid)))
    }

    fn write_at(&self, col: ColT, buf: IoVec, sector: SectorT,
                pri: Priority, key: QueueKey) -> BoxDiskFut
    {
        self.queues.write_at(col, buf, sector, pri, key)
    }
}

/// Rebuild the lost unit of stripe `sid`.
///
/// The caller must hold the stripe's lock exclusively.  A read error on a
/// surviving disk fails that disk and, if the stripe can still tolerate it,
/// tries again with the larger erasure set.
pub async fn rebuild_ru<H>(host: &H, ctl: &ReconControl, sid: StripeT,
                           pri: Priority, kind: BufferKind) -> Result<()>
    where H: ReconHost + ?Sized
{
    loop {
        if ctl.is_rebuilt(sid) {
            return Ok(());
        }
        let cols = host.layout().stripe_cols(sid)?;
        let Some(lost) = cols.iter().position(|c| *c == ctl.col()) else {
            // Declustered stripes needn't touch every disk
            ctl.set_rebuilt(sid);
            return Ok(());
        };
        let lost = lost as u32;
        let asm = host.map_stripe(sid)?;
        let spare = match ctl.spare() {
            Some(s) => {
                let primary = host.layout().map_unit(sid, lost, false)?;
                PhysAddr::new(s, primary.sector)
            }
            None => host.layout().map_unit(sid, lost, true)?
        };
        let ctx = host.build_ctx();
        // One buffer per surviving unit read
        let nreads = ctx.codec.recovery_terms(&asm.failed(), lost)?.len();
        let mut bufs = ctl.pool().make_recon_buffers(kind, nreads).await;
        let storage = bufs.iter_mut().filter_map(ReconBuffer::take).collect();
        let mut arena = Arena::default();
        let mut dag = build_recon(&ctx, &asm, lost, spare, pri, storage,
                                  &mut arena)?;
        let io = ReconIo{queues: host.queues(), tracker: ctl.tracker(), sid};
        let r = execute(&mut dag, &mut arena, &io).await;
        let failed = dag.header.failed_cols.clone();
        drop(dag);
        drop(bufs);
        match r {
            Ok(()) => {
                ctl.set_rebuilt(sid);
                return Ok(());
            }
            Err(e) => {
                if failed.is_empty() {
                    return Err(e);
                }
                for col in failed.iter() {
                    host.fail_disk(*col)?;
                }
                if failed.contains(&spare.col) {
                    tracing::error!(sid, col = ctl.col(),
                        "Reconstruction write failed: {e}");
                    return Err(e);
                }
                tracing::warn!(sid, col = ctl.col(),
                    "Retrying RU with a larger erasure set");
            }
        }
    }
}

/// The columns that rebuilding stripe `sid` will read from
fn sources<H>(host: &H, ctl: &ReconControl, sid: StripeT) -> Result<Vec<ColT>>
    where H: ReconHost + ?Sized
{
    let cols = host.layout().stripe_cols(sid)?;
    let Some(lost) = cols.iter().position(|c| *c == ctl.col()) else {
        return Ok(Vec::new());
    };
    let asm = host.map_stripe(sid)?;
    if asm.units[lost].is_available() {
        return Ok(Vec::new());
    }
    let terms = host.build_ctx().codec.recovery_terms(&asm.failed(),
                                                      lost as u32)?;
    Ok(terms.into_iter()
        .map(|(u, _)| asm.units[u as usize].addr.col)
        .collect())
}

/// Background-rebuild one stripe
async fn rebuild_background<H>(host: &H, ctl: &ReconControl, sid: StripeT)
    -> Result<()>
    where H: ReconHost + ?Sized
{
    let (psid, _) = host.layout().map_sid_to_psid(sid);
    let r = {
        let _guard = host.locks().write(&[psid]).await;
        rebuild_ru(host, ctl, sid, Priority::Low, BufferKind::Floating).await
    };
    ctl.finish(sid);
    r
}

/// Rebuild every stripe of `ctl`'s column.
///
/// Returns once every RU has been rebuilt, or once one has failed and every
/// RU already started has finished.
#[tracing::instrument(skip(host, ctl), fields(col = ctl.col()))]
pub async fn reconstruct<H>(host: &H, ctl: &ReconControl) -> Result<()>
    where H: ReconHost + ?Sized
{
    let nstripes = ctl.nstripes();
    let mut inflight = FuturesUnordered::new();
    let mut next: StripeT = 0;
    let mut status = Ok(());

    tracing::info!(nstripes, spare = ?ctl.spare(), "Reconstruction starting");
    loop {
        while status.is_ok() && next < nstripes && ctl.may_start(next) {
            let cols = match sources(host, ctl, next) {
                Ok(cols) => cols,
                Err(e) => {
                    status = Err(e);
                    break;
                }
            };
            ctl.begin(next, &cols);
            inflight.push(rebuild_background(host, ctl, next));
            next += 1;
        }
        if inflight.is_empty() {
            break;
        }
        let progress = pin!(ctl.progress());
        match future::select(inflight.next(), progress).await {
            Either::Left((Some(Err(e)), _)) => {
                if status.is_ok() {
                    status = Err(e);
                }
            }
            Either::Left(_) | Either::Right(_) => ()
        }
    }
    match &status {
        Ok(()) => tracing::info!(rebuilt = ctl.nrebuilt(),
                                 "Reconstruction complete"),
        Err(e) => tracing::error!("Reconstruction failed: {e}"),
    }
    status
}
