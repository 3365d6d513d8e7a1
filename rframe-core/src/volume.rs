// vim: tw=80
//! A RAID volume: the public entry points of the engine
//!
//! `RaidVolume` ties the pieces together.  Each access is split at stripe
//! boundaries, locked, turned into one DAG per stripe, and executed against
//! the member disks' queues.  The volume also tracks the health of every
//! column and drives reconstruction onto spare space.

use futures::{
    channel::mpsc,
    future,
};
use futures_locks::{RwLock as AsyncRwLock, RwLockReadGuard};
use std::{
    collections::BTreeMap,
    num::NonZeroU8,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    asm::*,
    codec::Codec,
    config::VolumeConfig,
    dag::*,
    disk::Disk,
    disk_queue::{DiskQueue, Priority},
    health::*,
    layout::*,
    recon::{self, BufferKind, ReconBufferPool, ReconControl, ReconHost},
    stripe_lock::StripeLocks,
    types::*,
    util::*,
};

type LoadFn = Box<dyn Fn(ColT) -> usize + Send + Sync>;

/// Health of every column, and the rebuilds in progress
#[derive(Default)]
struct Health {
    /// Members first, then dedicated spares
    status: Vec<DiskStatus>,
    /// Rebuild state, for each column being reconstructed
    recon: BTreeMap<ColT, Arc<ReconControl>>,
    state: Option<VolumeState>,
}

impl Health {
    fn state(&self) -> VolumeState {
        self.state.unwrap_or(VolumeState::Optimal)
    }
}

pub struct RaidVolume {
    config: VolumeConfig,
    layout: LayoutImpl,
    codec: Codec,
    /// Number of member columns.  Spares follow them.
    nmembers: ColT,
    queues: Vec<DiskQueue>,
    health: RwLock<Health>,
    locks: StripeLocks,
    pool: ReconBufferPool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<VolumeEvent>>>,
    closed: AtomicBool,
    /// Every access and rebuild holds this for reading, so `close` can wait
    /// for them.
    gate: AsyncRwLock<()>,
    load: LoadFn,
}

impl RaidVolume {
    /// Usable size of the volume, in sectors
    pub fn capacity(&self) -> SectorT {
        self.layout.capacity()
    }

    /// Reject an access that the volume can't possibly perform.  Returns its
    /// length in sectors.
    fn check_access(&self, len: usize, sector: SectorT) -> Result<SectorT> {
        if len % BYTES_PER_SECTOR != 0 {
            return Err(Error::EINVAL);
        }
        let nsectors = (len / BYTES_PER_SECTOR) as SectorT;
        let end = sector.checked_add(nsectors).ok_or(Error::ERANGE)?;
        if end > self.capacity() {
            return Err(Error::ERANGE);
        }
        Ok(nsectors)
    }

    /// Stop accepting accesses, wait for those in progress, and drain every
    /// Disk Queue.
    #[tracing::instrument(skip(self), fields(uuid = %self.config.uuid))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _gate = self.gate.write().await;
        future::join_all(self.queues.iter().map(DiskQueue::remove)).await;
        self.pool.release();
        self.subscribers.lock().unwrap().clear();
        tracing::info!("Volume closed");
    }

    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    /// Assemble a volume from its member disks and its dedicated spares.
    ///
    /// Members are numbered from 0 in the order given.  Spares are numbered
    /// after them.
    pub fn create(config: VolumeConfig, disks: Vec<Arc<dyn Disk>>,
                  spares: Vec<Arc<dyn Disk>>) -> Result<Self>
    {
        config.validate()?;
        let ncols = disks.len() + spares.len();
        if disks.is_empty() || ncols > usize::from(ColT::MAX) {
            return Err(Error::EINVAL);
        }
        let sectors_per_disk = disks.iter()
            .map(|d| d.size())
            .min()
            .unwrap_or(0);
        if spares.iter().any(|s| s.size() < sectors_per_disk) {
            tracing::warn!("Spare is smaller than the members");
            return Err(Error::EINVAL);
        }
        let nmembers = disks.len() as ColT;
        let geom = Geometry {
            num_col: nmembers,
            sectors_per_su: config.sectors_per_stripe_unit,
            sectors_per_disk,
        };
        let layout = LayoutImpl::new(&config.layout, geom)?;
        // GF(2^8) can't code across more than 255 units
        if layout.num_stripes() == 0 || layout.stripe_width() > 255 {
            return Err(Error::EINVAL);
        }
        let codec = Codec::new(layout.num_data_col(), layout.num_check_col());
        let queues = disks.into_iter()
            .chain(spares)
            .map(|d| DiskQueue::new(d, config.queue.max_retries))
            .collect::<Vec<_>>();
        let status = (0..ncols)
            .map(|c| if c < usize::from(nmembers) {
                DiskStatus::Optimal
            } else {
                DiskStatus::Spare
            }).collect();
        let health = Health{status, ..Default::default()};
        let pool = ReconBufferPool::new(
            config.recon.floating_buffers(layout.stripe_width()),
            config.sectors_per_stripe_unit);
        let load_queues = queues.clone();
        let load: LoadFn = Box::new(move |col| {
            load_queues.get(usize::from(col))
                .map(DiskQueue::load)
                .unwrap_or(usize::MAX)
        });
        tracing::info!(uuid = %config.uuid, layout = ?config.layout,
                       capacity = layout.capacity(), "Created volume");
        Ok(RaidVolume {
            config,
            layout,
            codec,
            nmembers,
            queues,
            health: RwLock::new(health),
            locks: StripeLocks::default(),
            pool,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            gate: AsyncRwLock::new(()),
            load,
        })
    }

    pub fn disk_status(&self, col: ColT) -> Option<DiskStatus> {
        self.health.read().unwrap().status.get(usize::from(col)).copied()
    }

    fn emit(&self, event: VolumeEvent) {
        self.subscribers.lock().unwrap()
            .retain(|tx| tx.unbounded_send(event).is_ok());
    }

    /// Enter the volume for an access or rebuild
    async fn enter(&self) -> Result<RwLockReadGuard<()>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EPIPE);
        }
        let guard = self.gate.read().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::EPIPE);
        }
        Ok(guard)
    }

    /// Rebuild any failed unit that a write to these stripes would touch,
    /// before the write goes ahead.
    ///
    /// The caller must hold the stripes' locks exclusively.
    async fn force_recon(&self, asms: &[AccessStripeMap]) -> Result<bool> {
        let ctls = self.health.read().unwrap().recon.values()
            .cloned()
            .collect::<Vec<_>>();
        let mut forced = false;
        for asm in asms.iter() {
            for ctl in ctls.iter() {
                if ctl.is_rebuilt(asm.sid) {
                    continue;
                }
                let cols = self.layout.stripe_cols(asm.sid)?;
                let Some(unit) = cols.iter().position(|c| *c == ctl.col())
                else {
                    continue;
                };
                let unit = unit as u32;
                let touched = unit >= asm.nd ||
                    asm.ranges.iter().any(|r| r.unit == unit);
                if touched {
                    tracing::debug!(sid = asm.sid, col = ctl.col(),
                                    "Forcing reconstruction");
                    recon::rebuild_ru(self, ctl, asm.sid, Priority::High,
                                      BufferKind::Forced).await?;
                    forced = true;
                }
            }
        }
        Ok(forced)
    }

    /// Location and health of one unit, as seen by a new access
    fn resolve(&self, h: &Health, sid: StripeT, unit: u32, addr: PhysAddr)
        -> Result<UnitMap>
    {
        let failed = Ok(UnitMap{addr, health: UnitHealth::Failed});
        match h.status[usize::from(addr.col)] {
            DiskStatus::Optimal | DiskStatus::Spare | DiskStatus::UsedSpare =>
                Ok(UnitMap{addr, health: UnitHealth::Healthy}),
            DiskStatus::Failed => failed,
            DiskStatus::Reconstructing(spare) => {
                let rebuilt = h.recon.get(&addr.col)
                    .is_some_and(|ctl| ctl.is_rebuilt(sid));
                if rebuilt {
                    self.relocate(h, sid, unit, addr, spare)
                } else {
                    failed
                }
            }
            DiskStatus::Spared(spare) =>
                self.relocate(h, sid, unit, addr, spare)
        }
    }

    fn relocate(&self, h: &Health, sid: StripeT, unit: u32, addr: PhysAddr,
                spare: Option<ColT>) -> Result<UnitMap>
    {
        let target = match spare {
            Some(s) => PhysAddr::new(s, addr.sector),
            None => self.layout.map_unit(sid, unit, true)?
        };
        let health = match h.status[usize::from(target.col)] {
            DiskStatus::Optimal | DiskStatus::UsedSpare =>
                UnitHealth::Relocated,
            _ => UnitHealth::Failed
        };
        Ok(UnitMap{addr: target, health})
    }

    /// Split an access into stripes, with the current health of every unit
    fn map(&self, sector: SectorT, nsectors: SectorT)
        -> Result<Vec<AccessStripeMap>>
    {
        let h = self.health.read().unwrap();
        if h.state() == VolumeState::Failed {
            return Err(Error::ENXIO);
        }
        map_access(&self.layout, sector, nsectors,
                   |sid, unit, addr| self.resolve(&h, sid, unit, addr))
    }

    /// Mark a column as failed.
    ///
    /// The volume stops using it immediately.  If it was a spare holding a
    /// rebuilt column, that column is failed again.
    #[tracing::instrument(skip(self))]
    pub fn mark_disk_failed(&self, col: ColT) -> Result<()> {
        let (before, after) = {
            let mut h = self.health.write().unwrap();
            let idx = usize::from(col);
            let old = *h.status.get(idx).ok_or(Error::EINVAL)?;
            match old {
                DiskStatus::Optimal | DiskStatus::Spare => (),
                DiskStatus::UsedSpare => {
                    // Whatever was rebuilt onto this spare is gone again
                    for m in 0..usize::from(self.nmembers) {
                        if h.status[m] == DiskStatus::Spared(Some(col)) {
                            h.status[m] = DiskStatus::Failed;
                            h.recon.remove(&(m as ColT));
                        }
                    }
                }
                DiskStatus::Failed |
                DiskStatus::Reconstructing(_) |
                DiskStatus::Spared(_) => return Ok(())
            }
            h.status[idx] = DiskStatus::Failed;
            let before = h.state();
            let after = self.recompute_state(&mut h);
            (before, after)
        };
        tracing::warn!(%before, %after, "Disk failed");
        self.emit(VolumeEvent::DiskFailed(col));
        if after == VolumeState::Failed && before != VolumeState::Failed {
            tracing::error!("Volume failed");
            self.emit(VolumeEvent::VolumeFailed);
        }
        Ok(())
    }

    /// Turn the results of an access's DAGs into one outcome.
    ///
    /// Disks that failed are marked as such.  Returns `EAGAIN` if the access
    /// may be retried against the degraded volume, or `ENXIO` if data is lost.
    fn outcome<'a, I>(&self, headers: I) -> Result<()>
        where I: IntoIterator<Item = &'a DagHeader>
    {
        let mut status = Ok(());
        let mut disk_error = false;
        for header in headers {
            let Err(e) = header.status else { continue };
            if e == Error::EPIPE {
                return Err(Error::EPIPE);
            }
            for col in header.failed_cols.iter() {
                disk_error = true;
                self.mark_disk_failed(*col)?;
            }
            if status.is_ok() {
                status = Err(e);
            }
        }
        match status {
            Ok(()) => Ok(()),
            Err(_) if self.state() == VolumeState::Failed => Err(Error::ENXIO),
            Err(_) if disk_error => Err(Error::EAGAIN),
            Err(e) => Err(e),
        }
    }

    /// Move queued reconstruction reads for these stripes ahead of other work
    fn promote(&self, keys: &[(StripeT, RuT)]) {
        if self.state() != VolumeState::Reconstructing {
            return;
        }
        for (psid, which_ru) in keys.iter() {
            for q in self.queues.iter() {
                q.promote(*psid, *which_ru);
            }
        }
    }

    /// Physical stripe IDs of every stripe touched by an access
    fn psids(&self, sector: SectorT, nsectors: SectorT) -> Vec<(StripeT, RuT)> {
        let stripe_sectors = self.stripe_sectors();
        let first = sector / stripe_sectors;
        let last = (sector + nsectors - 1) / stripe_sectors;
        (first..=last).map(|sid| self.layout.map_sid_to_psid(sid)).collect()
    }

    /// Read `buf.len()` bytes starting at volume sector `sector`
    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn raid_read(&self, mut buf: IoVecMut, sector: SectorT)
        -> Result<()>
    {
        let nsectors = self.check_access(buf.len(), sector)?;
        if nsectors == 0 {
            return Ok(());
        }
        let _gate = self.enter().await?;
        let keys = self.psids(sector, nsectors);
        self.promote(&keys);
        let psids = keys.iter().map(|k| k.0).collect::<Vec<_>>();
        let _guards = self.locks.read(&psids).await;

        let asms = self.map(sector, nsectors)?;
        let ctx = self.build_ctx();
        let mut dags = asms.iter()
            .map(|asm| {
                let mut arena = Arena::default();
                build_read(&ctx, asm, &mut arena).map(|dag| (dag, arena))
            }).collect::<Result<Vec<_>>>()?;
        future::join_all(dags.iter_mut().map(|(dag, arena)|
            execute(dag, arena, &self.queues[..])
        )).await;
        self.outcome(dags.iter().map(|(dag, _)| &dag.header))?;
        for (asm, (dag, _)) in asms.iter().zip(dags.iter()) {
            let start = sectors2bytes(asm.access_off);
            let end = start + sectors2bytes(asm.len());
            dag.copy_out(&mut buf[start..end])?;
        }
        Ok(())
    }

    /// Write `buf` starting at volume sector `sector`
    #[tracing::instrument(skip(self, buf), fields(len = buf.len()))]
    pub async fn raid_write(&self, buf: IoVec, sector: SectorT) -> Result<()> {
        let nsectors = self.check_access(buf.len(), sector)?;
        if nsectors == 0 {
            return Ok(());
        }
        let _gate = self.enter().await?;
        let keys = self.psids(sector, nsectors);
        self.promote(&keys);
        let psids = keys.iter().map(|k| k.0).collect::<Vec<_>>();
        let _guards = self.locks.write(&psids).await;

        let mut asms = self.map(sector, nsectors)?;
        match self.force_recon(&asms).await {
            Ok(false) => (),
            // Rebuilt units now live on spare space
            Ok(true) => asms = self.map(sector, nsectors)?,
            Err(_) if self.state() == VolumeState::Failed =>
                return Err(Error::ENXIO),
            Err(Error::EPIPE) => return Err(Error::EPIPE),
            Err(_) => return Err(Error::EAGAIN),
        }
        let ctx = self.build_ctx();
        let mut dags = asms.iter()
            .map(|asm| {
                let start = sectors2bytes(asm.access_off);
                let end = start + sectors2bytes(asm.len());
                let mut arena = Arena::default();
                build_write(&ctx, asm, buf.slice(start, end), &mut arena)
                    .map(|dag| (dag, arena))
            }).collect::<Result<Vec<_>>>()?;
        future::join_all(dags.iter_mut().map(|(dag, arena)|
            execute(dag, arena, &self.queues[..])
        )).await;
        self.outcome(dags.iter().map(|(dag, _)| &dag.header))
    }

    /// Rebuild a failed member column onto spare space.
    ///
    /// Uses the first unused dedicated spare, or the layout's distributed
    /// spare space.  Completes when every RU has been rebuilt, or when the
    /// rebuild has failed.
    #[tracing::instrument(skip(self))]
    pub async fn reconstruct(&self, col: ColT) -> Result<()> {
        let _gate = self.enter().await?;
        let ctl = {
            let mut h = self.health.write().unwrap();
            if h.state() == VolumeState::Failed {
                return Err(Error::ENXIO);
            }
            let idx = usize::from(col);
            match h.status.get(idx) {
                Some(DiskStatus::Failed) if col < self.nmembers => (),
                Some(DiskStatus::Reconstructing(_)) => {
                    return Err(Error::EALREADY)
                }
                _ => return Err(Error::EINVAL)
            }
            let members = usize::from(self.nmembers);
            let spare = if self.layout.distributed_spare() {
                // Distributed spare space can absorb only one column
                let used = h.status[..members].iter().any(|s| matches!(s,
                    DiskStatus::Reconstructing(None) |
                    DiskStatus::Spared(None)));
                if used {
                    return Err(Error::ENOSPC);
                }
                None
            } else {
                let s = (members..h.status.len())
                    .find(|s| h.status[*s] == DiskStatus::Spare)
                    .ok_or(Error::ENOSPC)?;
                h.status[s] = DiskStatus::UsedSpare;
                Some(s as ColT)
            };
            h.status[idx] = DiskStatus::Reconstructing(spare);
            let ctl = Arc::new(ReconControl::new(col, spare,
                self.layout.num_stripes(), self.layout.stripe_width(),
                &self.config.recon, self.pool.clone()));
            h.recon.insert(col, ctl.clone());
            self.recompute_state(&mut h);
            ctl
        };

        let r = recon::reconstruct(self, &ctl).await;

        let spare = ctl.spare();
        let (before, after, ok) = {
            let mut h = self.health.write().unwrap();
            let idx = usize::from(col);
            let ours = h.status[idx] == DiskStatus::Reconstructing(spare);
            let ok = r.is_ok() && ours;
            if ok {
                h.status[idx] = DiskStatus::Spared(spare);
            } else {
                if ours {
                    h.status[idx] = DiskStatus::Failed;
                }
                if let Some(s) = spare {
                    let s = usize::from(s);
                    if h.status[s] == DiskStatus::UsedSpare {
                        h.status[s] = DiskStatus::Spare;
                    }
                }
                h.recon.remove(&col);
            }
            let before = h.state();
            let after = self.recompute_state(&mut h);
            (before, after, ok)
        };
        if ok {
            self.emit(VolumeEvent::ReconstructionComplete(col));
        } else {
            self.emit(VolumeEvent::ReconstructionFailed(col));
            if after == VolumeState::Failed && before != VolumeState::Failed {
                self.emit(VolumeEvent::VolumeFailed);
            }
        }
        match r {
            Ok(()) if !ok => Err(Error::ENXIO),
            r => r
        }
    }

    /// Next stripe that the rebuild of `col` will start, if one is running
    pub fn recon_cursor(&self, col: ColT) -> Option<StripeT> {
        let h = self.health.read().unwrap();
        match h.status.get(usize::from(col)) {
            Some(DiskStatus::Reconstructing(_)) =>
                h.recon.get(&col).map(|ctl| ctl.cursor()),
            _ => None
        }
    }

    /// Derive the volume state from the column statuses.  Once failed, a
    /// volume stays failed.
    fn recompute_state(&self, h: &mut Health) -> VolumeState {
        let members = usize::from(self.nmembers);
        let lost = |s: &DiskStatus| s.is_failed();
        let nlost = h.status[..members].iter().filter(|s| lost(s)).count();
        let rebuilding = h.status[..members].iter()
            .any(|s| matches!(s, DiskStatus::Reconstructing(_)));
        let data_lost = match self.layout.redundancy() {
            // Only the loss of both halves of a pair loses data
            Redundancy::Mirror => h.status[..members].chunks(2)
                .any(|pair| pair.iter().all(lost)),
            _ => nlost > self.layout.fault_tolerance() as usize
        };
        let state = if h.state() == VolumeState::Failed || data_lost {
            VolumeState::Failed
        } else if rebuilding {
            VolumeState::Reconstructing
        } else if let Some(n) = NonZeroU8::new(nlost as u8) {
            VolumeState::Degraded(n)
        } else {
            VolumeState::Optimal
        };
        if Some(state) != h.state {
            tracing::warn!(from = %h.state(), to = %state,
                           "Volume state changed");
        }
        h.state = Some(state);
        state
    }

    pub fn state(&self) -> VolumeState {
        self.health.read().unwrap().state()
    }

    fn stripe_sectors(&self) -> SectorT {
        self.layout.geometry().sectors_per_su *
            SectorT::from(self.layout.num_data_col())
    }

    /// Receive notifications of disk failures and rebuild progress
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<VolumeEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn uuid(&self) -> Uuid {
        self.config.uuid
    }
}

impl ReconHost for RaidVolume {
    fn build_ctx(&self) -> BuildCtx<'_> {
        BuildCtx {
            codec: self.codec,
            redundancy: self.layout.redundancy(),
            mirror_read: self.config.mirror_read,
            load: &*self.load,
        }
    }

    fn fail_disk(&self, col: ColT) -> Result<()> {
        self.mark_disk_failed(col)?;
        if self.state() == VolumeState::Failed {
            Err(Error::ENXIO)
        } else {
            Ok(())
        }
    }

    fn layout(&self) -> &LayoutImpl {
        &self.layout
    }

    fn locks(&self) -> &StripeLocks {
        &self.locks
    }

    fn map_stripe(&self, sid: StripeT) -> Result<AccessStripeMap> {
        let stripe_sectors = self.stripe_sectors();
        self.map(sid * stripe_sectors, stripe_sectors)?
            .pop()
            .ok_or(Error::ERANGE)
    }

    fn queues(&self) -> &[DiskQueue] {
        &self.queues
    }
}

// LCOV_EXCL_STOP
