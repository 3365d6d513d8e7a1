// vim: tw=80
//! DAG Builder
//!
//! Turns one [`AccessStripeMap`] into an executable [`Dag`].  Construction is
//! synchronous, in memory, and never performs I/O.  If the stripe has lost
//! more units than its layout can tolerate, construction fails with `ENXIO`
//! rather than producing a graph that could only fail at run time.
//!
//! Every graph has the same skeleton:
//!
//! ```text
//! root -> reads -> computes -> commit -> writes -> term
//! ```
//!
//! where any of the middle stages may be empty.  A compute node waits only for
//! the reads that feed it.

use std::collections::HashMap;

use crate::{
    asm::*,
    codec::{Codec, gmul},
    config::MirrorReadPolicy,
    disk_queue::Priority,
    layout::Redundancy,
    types::*,
};
use super::*;

/// Everything the builder needs to know besides the stripe map
pub struct BuildCtx<'a> {
    pub codec: Codec,
    pub redundancy: Redundancy,
    pub mirror_read: MirrorReadPolicy,
    /// Outstanding work on each column
    pub load: &'a (dyn Fn(ColT) -> usize + Sync),
}

impl<'a> BuildCtx<'a> {
    fn check_tolerance(&self, asm: &AccessStripeMap) -> Result<()> {
        if asm.nfailed() > self.codec.protection() {
            tracing::warn!(sid = asm.sid, failed = asm.nfailed(),
                           "Stripe has lost too many units");
            Err(Error::ENXIO)
        } else {
            Ok(())
        }
    }
}

/// Accumulates the stages of a graph before wiring them together
struct Stages {
    dag: Dag,
    reads: Vec<(NodeKind, usize)>,
    /// Reads already planned, keyed by unit, start, and length
    planned: HashMap<(u32, SectorT, SectorT), usize>,
    computes: Vec<NodeKind>,
    writes: Vec<NodeKind>,
    pri: Priority,
}

impl Stages {
    fn new(shape: DagShape, asm: &AccessStripeMap, pri: Priority,
           arena: &mut Arena<Node>) -> Self
    {
        tracing::debug!(sid = asm.sid, %shape, "Building DAG");
        Stages {
            dag: Dag::new(shape, (asm.psid, asm.which_ru), arena),
            reads: Vec::new(),
            planned: HashMap::new(),
            computes: Vec::new(),
            writes: Vec::new(),
            pri,
        }
    }

    /// Plan a read of `len` sectors from `unit`, starting `start` sectors into
    /// it.  Returns the buffer that will hold the result.
    fn read(&mut self, asm: &AccessStripeMap, unit: u32, start: SectorT,
            len: SectorT) -> usize
    {
        self.read_into(asm, unit, start, len, None)
    }

    /// Like `read`, but into caller-supplied storage if it's the right size
    fn read_into(&mut self, asm: &AccessStripeMap, unit: u32, start: SectorT,
                 len: SectorT, storage: Option<DivBufShared>) -> usize
    {
        if let Some(buf) = self.planned.get(&(unit, start, len)) {
            return *buf;
        }
        let buf = match storage {
            Some(dbs) if dbs.len() == sectors2bytes(len) =>
                self.dag.adopt_buf(dbs),
            _ => self.dag.add_buf(len)
        };
        let kind = NodeKind::Read {
            addr: asm.unit_addr(unit, start),
            buf,
            pri: self.pri
        };
        self.reads.push((kind, buf));
        self.planned.insert((unit, start, len), buf);
        buf
    }

    /// Plan a compute node.  Returns its output buffer.
    fn compute(&mut self, len: SectorT, terms: Vec<LinearTerm>) -> usize {
        let dst = self.dag.add_buf(len);
        self.computes.push(NodeKind::Compute{dst, terms});
        dst
    }

    fn write(&mut self, addr: PhysAddr, src: BufRef, off: SectorT,
             len: SectorT)
    {
        self.writes.push(NodeKind::Write{addr, src, off, len, pri: self.pri});
    }

    /// Wire the stages together
    fn finish(self, arena: &mut Arena<Node>) -> Dag {
        let Stages{mut dag, reads, computes, writes, ..} = self;
        let root = dag.root;
        let commit = dag.add_node(arena, NodeKind::Commit);
        let term = dag.add_node(arena, NodeKind::Term);

        let mut producers = HashMap::new();
        let mut consumed = vec![false; reads.len()];
        let read_idxs = reads.into_iter()
            .enumerate()
            .map(|(i, (kind, buf))| {
                let idx = dag.add_node(arena, kind);
                producers.insert(buf, i);
                Dag::edge(arena, root, idx);
                idx
            }).collect::<Vec<_>>();
        for kind in computes.into_iter() {
            let srcs = match &kind {
                NodeKind::Compute{terms, ..} => terms.iter()
                    .filter_map(|t| match t.src {
                        BufRef::Scratch(b) => producers.get(&b).copied(),
                        BufRef::User => None
                    }).collect::<Vec<_>>(),
                _ => Vec::new()
            };
            let idx = dag.add_node(arena, kind);
            let mut deps = srcs;
            deps.sort_unstable();
            deps.dedup();
            if deps.is_empty() {
                Dag::edge(arena, root, idx);
            }
            for r in deps {
                consumed[r] = true;
                Dag::edge(arena, read_idxs[r], idx);
            }
            Dag::edge(arena, idx, commit);
        }
        for (r, idx) in read_idxs.iter().enumerate() {
            if !consumed[r] {
                Dag::edge(arena, *idx, commit);
            }
        }
        if arena[commit].npred == 0 {
            Dag::edge(arena, root, commit);
        }
        for kind in writes.into_iter() {
            let idx = dag.add_node(arena, kind);
            Dag::edge(arena, commit, idx);
            Dag::edge(arena, idx, term);
        }
        if arena[term].npred == 0 {
            Dag::edge(arena, commit, term);
        }
        debug_assert!(dag.topo_order(arena).is_some());
        dag
    }
}

/// Build the DAG for reading the data described by `asm`
pub fn build_read(ctx: &BuildCtx, asm: &AccessStripeMap,
                  arena: &mut Arena<Node>) -> Result<Dag>
{
    ctx.check_tolerance(asm)?;
    match ctx.redundancy {
        Redundancy::Mirror => mirror_read(ctx, asm, arena),
        Redundancy::None => {
            let mut st = Stages::new(DagShape::NonredundantRead, asm,
                                     Priority::High, arena);
            plain_reads(&mut st, asm);
            Ok(st.finish(arena))
        }
        Redundancy::Parity | Redundancy::Pq => {
            let failed = asm.failed();
            if asm.ranges.iter().all(|r| !failed.contains(r.unit as usize)) {
                let mut st = Stages::new(DagShape::FaultFreeRead, asm,
                                         Priority::High, arena);
                plain_reads(&mut st, asm);
                Ok(st.finish(arena))
            } else {
                degraded_read(ctx, asm, arena)
            }
        }
    }
}

/// One read per touched range, straight into the output
fn plain_reads(st: &mut Stages, asm: &AccessStripeMap) {
    for r in asm.ranges.iter() {
        let buf = st.read(asm, r.unit, r.start, r.len);
        st.dag.add_output(buf, r.buf_off, r.len);
    }
}

fn degraded_read(ctx: &BuildCtx, asm: &AccessStripeMap,
                 arena: &mut Arena<Node>) -> Result<Dag>
{
    let failed = asm.failed();
    let mut st = Stages::new(DagShape::DegradedRead, asm, Priority::High,
                             arena);
    for r in asm.ranges.iter() {
        if !failed.contains(r.unit as usize) {
            let buf = st.read(asm, r.unit, r.start, r.len);
            st.dag.add_output(buf, r.buf_off, r.len);
            continue;
        }
        let terms = ctx.codec.recovery_terms(&failed, r.unit)?
            .into_iter()
            .map(|(u, coeff)| {
                let src = st.read(asm, u, r.start, r.len);
                LinearTerm {
                    coeff,
                    src: BufRef::Scratch(src),
                    src_off: 0,
                    dst_off: 0,
                    len: r.len
                }
            }).collect();
        let dst = st.compute(r.len, terms);
        st.dag.add_output(dst, r.buf_off, r.len);
    }
    Ok(st.finish(arena))
}

fn mirror_read(ctx: &BuildCtx, asm: &AccessStripeMap, arena: &mut Arena<Node>)
    -> Result<Dag>
{
    let primary = asm.units[0];
    let secondary = asm.units[1];
    let both = primary.is_available() && secondary.is_available();
    let shape = match (both, ctx.mirror_read) {
        (false, _) => DagShape::DegradedRead,
        (true, MirrorReadPolicy::Idle) => DagShape::MirrorIdleRead,
        (true, MirrorReadPolicy::Partition) => DagShape::MirrorPartitionRead,
    };
    let mut st = Stages::new(shape, asm, Priority::High, arena);
    for r in asm.ranges.iter() {
        if shape == DagShape::MirrorPartitionRead && r.len >= 2 {
            let half = r.len / 2;
            let b0 = st.read(asm, 0, r.start, half);
            st.dag.add_output(b0, r.buf_off, half);
            let b1 = st.read(asm, 1, r.start + half, r.len - half);
            st.dag.add_output(b1, r.buf_off + half, r.len - half);
        } else {
            let unit = if !primary.is_available() {
                1
            } else if !secondary.is_available() {
                0
            } else {
                let l0 = (ctx.load)(primary.addr.col);
                let l1 = (ctx.load)(secondary.addr.col);
                u32::from(l1 < l0)
            };
            let buf = st.read(asm, unit, r.start, r.len);
            st.dag.add_output(buf, r.buf_off, r.len);
        }
    }
    Ok(st.finish(arena))
}

/// Build the DAG for writing `data` as described by `asm`.
///
/// `data` holds exactly this stripe's portion of the access.
pub fn build_write(ctx: &BuildCtx, asm: &AccessStripeMap, data: IoVec,
                   arena: &mut Arena<Node>) -> Result<Dag>
{
    ctx.check_tolerance(asm)?;
    let mut dag = match ctx.redundancy {
        Redundancy::Mirror => copies_write(DagShape::MirrorWrite, asm, arena),
        Redundancy::None =>
            copies_write(DagShape::NonredundantWrite, asm, arena),
        Redundancy::Parity | Redundancy::Pq => {
            let failed = asm.failed();
            let nd = asm.nd as usize;
            let touched_ok = asm.ranges.iter()
                .all(|r| !failed.contains(r.unit as usize));
            let checks_ok = failed.ones().all(|u| u < nd);
            if asm.is_full_stripe() {
                large_write(ctx, asm, arena)
            } else if touched_ok && checks_ok {
                small_write(ctx, asm, arena)
            } else {
                degraded_write(ctx, asm, arena)?
            }
        }
    };
    dag.user = Some(data);
    Ok(dag)
}

/// Write the new data to every available copy.  With no redundancy there is
/// only one copy.
fn copies_write(shape: DagShape, asm: &AccessStripeMap,
                arena: &mut Arena<Node>) -> Dag
{
    let mut st = Stages::new(shape, asm, Priority::High, arena);
    for r in asm.ranges.iter() {
        let copies = if shape == DagShape::MirrorWrite {
            vec![0, 1]
        } else {
            vec![r.unit]
        };
        for u in copies {
            if asm.units[u as usize].is_available() {
                st.write(asm.unit_addr(u, r.start), BufRef::User, r.buf_off,
                         r.len);
            }
        }
    }
    st.finish(arena)
}

/// Full-stripe write: parity comes from the new data alone
fn large_write(ctx: &BuildCtx, asm: &AccessStripeMap, arena: &mut Arena<Node>)
    -> Dag
{
    let spu = asm.sectors_per_su;
    let mut st = Stages::new(DagShape::LargeWrite, asm, Priority::High, arena);
    for j in 0..ctx.codec.protection() {
        let cu = asm.nd + j;
        if !asm.units[cu as usize].is_available() {
            continue;
        }
        let terms = asm.ranges.iter()
            .map(|r| LinearTerm {
                coeff: ctx.codec.coefficient(j, r.unit),
                src: BufRef::User,
                src_off: r.buf_off,
                dst_off: 0,
                len: spu
            }).collect();
        let dst = st.compute(spu, terms);
        st.write(asm.unit_addr(cu, 0), BufRef::Scratch(dst), 0, spu);
    }
    for r in asm.ranges.iter() {
        if asm.units[r.unit as usize].is_available() {
            st.write(asm.unit_addr(r.unit, 0), BufRef::User, r.buf_off, spu);
        }
    }
    st.finish(arena)
}

/// Read-modify-write: `P' = P ⊕ D ⊕ D'` and `Q' = Q ⊕ g^i(D ⊕ D')`
fn small_write(ctx: &BuildCtx, asm: &AccessStripeMap, arena: &mut Arena<Node>)
    -> Dag
{
    let (us, ue) = asm.union_range();
    let ulen = ue - us;
    let mut st = Stages::new(DagShape::SmallWrite, asm, Priority::High, arena);
    let old = asm.ranges.iter()
        .map(|r| st.read(asm, r.unit, r.start, r.len))
        .collect::<Vec<_>>();
    for j in 0..ctx.codec.protection() {
        let cu = asm.nd + j;
        let oldc = st.read(asm, cu, us, ulen);
        let mut terms = vec![LinearTerm {
            coeff: 1,
            src: BufRef::Scratch(oldc),
            src_off: 0,
            dst_off: 0,
            len: ulen
        }];
        for (r, o) in asm.ranges.iter().zip(old.iter()) {
            let coeff = ctx.codec.coefficient(j, r.unit);
            let dst_off = r.start - us;
            terms.push(LinearTerm {
                coeff, src: BufRef::Scratch(*o), src_off: 0, dst_off,
                len: r.len
            });
            terms.push(LinearTerm {
                coeff, src: BufRef::User, src_off: r.buf_off, dst_off,
                len: r.len
            });
        }
        let dst = st.compute(ulen, terms);
        st.write(asm.unit_addr(cu, us), BufRef::Scratch(dst), 0, ulen);
    }
    for r in asm.ranges.iter() {
        st.write(asm.unit_addr(r.unit, r.start), BufRef::User, r.buf_off,
                 r.len);
    }
    st.finish(arena)
}

/// Write with a touched data unit or a check unit unavailable.
///
/// Reads every surviving unit over the touched range, then recomputes each
/// surviving check unit from the stripe's new contents.  The old contents of
/// failed data units are recovered from the survivors along the way.
fn degraded_write(ctx: &BuildCtx, asm: &AccessStripeMap,
                  arena: &mut Arena<Node>) -> Result<Dag>
{
    let (us, ue) = asm.union_range();
    let ulen = ue - us;
    let failed = asm.failed();
    let width = asm.units.len() as u32;
    let mut st = Stages::new(DagShape::DegradedWrite, asm, Priority::High,
                             arena);
    let live_checks = (asm.nd..width)
        .filter(|u| !failed.contains(*u as usize))
        .collect::<Vec<_>>();
    if !live_checks.is_empty() {
        let old = (0..width)
            .map(|u| (!failed.contains(u as usize))
                .then(|| st.read(asm, u, us, ulen)))
            .collect::<Vec<_>>();
        // Express the old contents of each data unit in terms of the buffers
        // that were read.
        let mut sources = Vec::with_capacity(asm.nd as usize);
        for i in 0..asm.nd {
            let terms = match old[i as usize] {
                Some(b) => vec![(b, 1)],
                None => ctx.codec.recovery_terms(&failed, i)?
                    .into_iter()
                    .map(|(u, c)| old[u as usize]
                         .map(|b| (b, c))
                         .ok_or(Error::ENXIO))
                    .collect::<Result<Vec<_>>>()?
            };
            sources.push(terms);
        }
        for cu in live_checks {
            let j = cu - asm.nd;
            let mut terms = Vec::new();
            for i in 0..asm.nd {
                let c = ctx.codec.coefficient(j, i);
                for (b, rc) in sources[i as usize].iter() {
                    terms.push(LinearTerm {
                        coeff: gmul(c, *rc),
                        src: BufRef::Scratch(*b),
                        src_off: 0,
                        dst_off: 0,
                        len: ulen
                    });
                }
                // Replace the old contents of the touched range with the new
                if let Some(r) = asm.ranges.iter().find(|r| r.unit == i) {
                    let off = r.start - us;
                    for (b, rc) in sources[i as usize].iter() {
                        terms.push(LinearTerm {
                            coeff: gmul(c, *rc),
                            src: BufRef::Scratch(*b),
                            src_off: off,
                            dst_off: off,
                            len: r.len
                        });
                    }
                    terms.push(LinearTerm {
                        coeff: c,
                        src: BufRef::User,
                        src_off: r.buf_off,
                        dst_off: off,
                        len: r.len
                    });
                }
            }
            let dst = st.compute(ulen, terms);
            st.write(asm.unit_addr(cu, us), BufRef::Scratch(dst), 0, ulen);
        }
    }
    for r in asm.ranges.iter() {
        if asm.units[r.unit as usize].is_available() {
            st.write(asm.unit_addr(r.unit, r.start), BufRef::User, r.buf_off,
                     r.len);
        }
    }
    Ok(st.finish(arena))
}

/// Build the DAG that regenerates unit `lost` of a stripe and writes it to
/// `spare`.
///
/// `lost` must be marked failed in `asm`.  Surviving units are read into
/// `storage`, one unit per buffer, for as long as it lasts.
pub fn build_recon(ctx: &BuildCtx, asm: &AccessStripeMap, lost: u32,
                   spare: PhysAddr, pri: Priority,
                   mut storage: Vec<DivBufShared>, arena: &mut Arena<Node>)
    -> Result<Dag>
{
    let failed = asm.failed();
    if !failed.contains(lost as usize) {
        return Err(Error::EINVAL);
    }
    ctx.check_tolerance(asm)?;
    let spu = asm.sectors_per_su;
    let mut st = Stages::new(DagShape::Reconstruct, asm, pri, arena);
    let terms = ctx.codec.recovery_terms(&failed, lost)?
        .into_iter()
        .map(|(u, coeff)| LinearTerm {
            coeff,
            src: BufRef::Scratch(st.read_into(asm, u, 0, spu, storage.pop())),
            src_off: 0,
            dst_off: 0,
            len: spu
        }).collect();
    let dst = st.compute(spu, terms);
    st.write(spare, BufRef::Scratch(dst), 0, spu);
    Ok(st.finish(arena))
}

// LCOV_EXCL_STOP
