// vim: tw=80
//! DAG Executor

use futures::{
    StreamExt,
    future,
    stream::FuturesUnordered,
};
use std::collections::{HashMap, VecDeque};

use crate::{
    codec::mul_xor_into,
    disk::BoxDiskFut,
    disk_queue::{DiskQueue, Priority, QueueKey},
    types::*,
    util::*,
};
use super::*;

/// Outcome of firing a single node
enum Fired {
    Done,
    Io(ColT, BoxDiskFut),
}

/// Label a disk operation with the node that issued it
async fn tag(idx: Idx, col: ColT, fut: BoxDiskFut) -> (Idx, ColT, Result<()>) {
    (idx, col, fut.await)
}

fn fire<IO>(dag: &Dag, kind: &NodeKind, io: &IO) -> Result<Fired>
    where IO: DagIo + ?Sized
{
    let key = dag.header.key;
    match kind {
        NodeKind::Nop | NodeKind::Commit | NodeKind::Term => Ok(Fired::Done),
        NodeKind::Read{addr, buf, pri} => {
            let dbm = dag.bufs[*buf].try_mut().map_err(|_| Error::EBUSY)?;
            let fut = io.read_at(addr.col, dbm, addr.sector, *pri, key);
            Ok(Fired::Io(addr.col, fut))
        }
        NodeKind::Write{addr, src, off, len, pri} => {
            let db = dag.source(*src, *off, *len)?;
            let fut = io.write_at(addr.col, db, addr.sector, *pri, key);
            Ok(Fired::Io(addr.col, fut))
        }
        NodeKind::Compute{dst, terms} => {
            let mut dbm = dag.bufs[*dst].try_mut().map_err(|_| Error::EBUSY)?;
            dbm[..].fill(0);
            for t in terms.iter() {
                let src = dag.source(t.src, t.src_off, t.len)?;
                let start = sectors2bytes(t.dst_off);
                let end = start + sectors2bytes(t.len);
                mul_xor_into(t.coeff, &src[..], &mut dbm[start..end]);
            }
            Ok(Fired::Done)
        }
    }
}

/// Run a DAG to completion.
///
/// Nodes fire once all of their predecessors have succeeded.  After the first
/// failure no further nodes fire, but operations already in flight are allowed
/// to finish.  Since writes all follow the commit node, a failure before the
/// commit point leaves the disks untouched.  Returns the DAG's status; the
/// columns that failed are recorded in its header.
pub async fn execute<IO>(dag: &mut Dag, arena: &mut Arena<Node>, io: &IO)
    -> Result<()>
    where IO: DagIo + ?Sized
{
    let mut waiting = dag.nodes.iter()
        .map(|idx| (*idx, arena[*idx].npred))
        .collect::<HashMap<_, _>>();
    let mut ready = VecDeque::from([dag.root]);
    let mut inflight = FuturesUnordered::new();

    loop {
        while dag.header.status.is_ok() {
            let Some(idx) = ready.pop_front() else { break };
            arena[idx].status = NodeStatus::Fired;
            match fire(dag, &arena[idx].kind, io) {
                Ok(Fired::Done) => {
                    release(arena, idx, &mut waiting, &mut ready);
                }
                Ok(Fired::Io(col, fut)) => inflight.push(tag(idx, col, fut)),
                Err(e) => {
                    tracing::error!(shape = %dag.header.shape,
                                    "Node failed: {e}");
                    arena[idx].status = NodeStatus::Bad;
                    dag.header.record(e, None);
                }
            }
        }
        match inflight.next().await {
            None => break,
            Some((idx, _, Ok(()))) => {
                release(arena, idx, &mut waiting, &mut ready);
            }
            Some((idx, col, Err(e))) => {
                tracing::debug!(shape = %dag.header.shape, col,
                                "Disk operation failed: {e}");
                arena[idx].status = NodeStatus::Bad;
                dag.header.record(e, Some(col));
            }
        }
    }
    dag.header.status.clone()
}

/// Mark a node good, and queue any successors that are now ready to fire
fn release(arena: &mut Arena<Node>, idx: Idx,
           waiting: &mut HashMap<Idx, u32>, ready: &mut VecDeque<Idx>)
{
    arena[idx].status = NodeStatus::Good;
    for s in arena[idx].succ.iter() {
        if let Some(n) = waiting.get_mut(s) {
            *n -= 1;
            if *n == 0 {
                ready.push_back(*s);
            }
        }
    }
}

impl DagIo for [DiskQueue] {
    fn read_at(&self, col: ColT, buf: IoVecMut, sector: SectorT,
               pri: Priority, key: QueueKey) -> BoxDiskFut
    {
        match self.get(usize::from(col)) {
            Some(dq) => Box::pin(dq.read_at(buf, sector, pri, key)),
            None => Box::pin(future::err(Error::ENXIO))
        }
    }

    fn write_at(&self, col: ColT, buf: IoVec, sector: SectorT,
                pri: Priority, key: QueueKey) -> BoxDiskFut
    {
        match self.get(usize::from(col)) {
            Some(dq) => Box::pin(dq.write_at(buf, sector, pri, key)),
            None => Box::pin(future::err(Error::ENXIO))
        }
    }
}

// LCOV_EXCL_STOP
