// vim: tw=80
//! Execution graphs
//!
//! Every access to one stripe is carried out by a DAG of primitive operations:
//! disk reads and writes, GF(2^8) linear combinations, and a commit point that
//! separates the reading half of the graph from the writing half.  The
//! [`builder`] chooses a graph shape from the stripe's fault state and the
//! [`exec`] module runs it.
//!
//! Nodes live in a caller-owned [`Arena`] that is freed as a unit once the
//! access completes.  Data buffers are owned by the [`Dag`] itself.

use divbuf::DivBufShared;
use std::{
    collections::VecDeque,
    fmt,
};

use crate::{
    disk::BoxDiskFut,
    disk_queue::{Priority, QueueKey},
    types::*,
    util::*,
};

pub mod arena;
mod builder;
mod exec;

pub use self::arena::{Arena, Idx};
pub use self::builder::{BuildCtx, build_read, build_recon, build_write};
pub use self::exec::execute;

/// The I/O services a DAG needs: one scheduled disk per column
pub trait DagIo {
    fn read_at(&self, col: ColT, buf: IoVecMut, sector: SectorT,
               pri: Priority, key: QueueKey) -> BoxDiskFut;

    fn write_at(&self, col: ColT, buf: IoVec, sector: SectorT,
                pri: Priority, key: QueueKey) -> BoxDiskFut;
}

/// Source of the data for a write or compute node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BufRef {
    /// One of the DAG's own buffers
    Scratch(usize),
    /// The caller's write data
    User,
}

/// `dst[dst_off..dst_off + len] ^= coeff · src[src_off..src_off + len]`.
/// Offsets and lengths are in sectors.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LinearTerm {
    pub coeff: u8,
    pub src: BufRef,
    pub src_off: SectorT,
    pub dst_off: SectorT,
    pub len: SectorT,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// Does nothing.  Every DAG's source node is one.
    Nop,
    /// Read into the whole of a scratch buffer
    Read {
        addr: PhysAddr,
        buf: usize,
        pri: Priority,
    },
    Write {
        addr: PhysAddr,
        src: BufRef,
        off: SectorT,
        len: SectorT,
        pri: Priority,
    },
    /// Fill a zeroed scratch buffer with a sum of linear terms
    Compute {
        dst: usize,
        terms: Vec<LinearTerm>,
    },
    /// Everything before this point may fail without side effects
    Commit,
    /// Sink node
    Term,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    Wait,
    Fired,
    Good,
    Bad,
}

#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    /// Nodes that may not start until this one succeeds
    pub succ: Vec<Idx>,
    /// Number of predecessors
    pub npred: u32,
    pub status: NodeStatus,
}

impl Node {
    fn new(kind: NodeKind) -> Self {
        Node{kind, succ: Vec::new(), npred: 0, status: NodeStatus::Wait}
    }
}

/// Which graph the builder chose
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DagShape {
    FaultFreeRead,
    NonredundantRead,
    MirrorIdleRead,
    MirrorPartitionRead,
    DegradedRead,
    LargeWrite,
    SmallWrite,
    DegradedWrite,
    MirrorWrite,
    NonredundantWrite,
    Reconstruct,
}

impl fmt::Display for DagShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Aggregate status of a DAG
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DagHeader {
    pub shape: DagShape,
    /// First error encountered, if any
    pub status: Result<()>,
    /// Columns whose I/O failed
    pub failed_cols: Vec<ColT>,
    /// Every disk operation of the DAG carries this key
    pub key: QueueKey,
}

impl DagHeader {
    /// Note a node's failure.  The first error wins.
    pub fn record(&mut self, e: Error, col: Option<ColT>) {
        if self.status.is_ok() {
            self.status = Err(e);
        }
        if let Some(c) = col {
            if !self.failed_cols.contains(&c) {
                self.failed_cols.push(c);
            }
        }
    }
}

/// Where part of a read's result ends up in the caller's buffer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Output {
    buf: usize,
    user_off: SectorT,
    len: SectorT,
}

/// One executable graph
pub struct Dag {
    pub header: DagHeader,
    pub root: Idx,
    /// Every node of the graph, in creation order
    nodes: Vec<Idx>,
    bufs: Vec<DivBufShared>,
    user: Option<IoVec>,
    outputs: Vec<Output>,
}

impl Dag {
    fn new(shape: DagShape, key: QueueKey, arena: &mut Arena<Node>) -> Self {
        let root = arena.insert(Node::new(NodeKind::Nop));
        let header = DagHeader {
            shape,
            status: Ok(()),
            failed_cols: Vec::new(),
            key,
        };
        Dag {
            header,
            root,
            nodes: vec![root],
            bufs: Vec::new(),
            user: None,
            outputs: Vec::new(),
        }
    }

    fn add_buf(&mut self, nsectors: SectorT) -> usize {
        self.bufs.push(zeroed_sectors(nsectors));
        self.bufs.len() - 1
    }

    /// Take ownership of an already allocated buffer
    fn adopt_buf(&mut self, dbs: DivBufShared) -> usize {
        self.bufs.push(dbs);
        self.bufs.len() - 1
    }

    fn add_node(&mut self, arena: &mut Arena<Node>, kind: NodeKind) -> Idx {
        let idx = arena.insert(Node::new(kind));
        self.nodes.push(idx);
        idx
    }

    fn add_output(&mut self, buf: usize, user_off: SectorT, len: SectorT) {
        self.outputs.push(Output{buf, user_off, len});
    }

    /// Copy a read's results into the caller's buffer.
    ///
    /// `dst` covers this stripe's portion of the access.
    pub fn copy_out(&self, dst: &mut [u8]) -> Result<()> {
        for o in self.outputs.iter() {
            let src = self.bufs[o.buf].try_const().map_err(|_| Error::EBUSY)?;
            let start = sectors2bytes(o.user_off);
            let len = sectors2bytes(o.len);
            dst[start..start + len].copy_from_slice(&src[..len]);
        }
        Ok(())
    }

    fn edge(arena: &mut Arena<Node>, from: Idx, to: Idx) {
        arena[from].succ.push(to);
        arena[to].npred += 1;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[Idx] {
        &self.nodes
    }

    /// A read-only view of part of a data source
    fn source(&self, r: BufRef, off: SectorT, len: SectorT) -> Result<IoVec> {
        let start = sectors2bytes(off);
        let end = start + sectors2bytes(len);
        match r {
            BufRef::Scratch(i) => {
                let db = self.bufs[i].try_const().map_err(|_| Error::EBUSY)?;
                Ok(db.slice(start, end))
            }
            BufRef::User => {
                let user = self.user.as_ref().ok_or(Error::EINVAL)?;
                Ok(user.slice(start, end))
            }
        }
    }

    /// Order the nodes so that each precedes all of its successors.
    ///
    /// Returns `None` if the graph has a cycle.
    pub fn topo_order(&self, arena: &Arena<Node>) -> Option<Vec<Idx>> {
        let mut npred = self.nodes.iter()
            .map(|idx| (*idx, arena[*idx].npred))
            .collect::<std::collections::HashMap<_, _>>();
        let mut ready = self.nodes.iter()
            .filter(|idx| arena[**idx].npred == 0)
            .copied()
            .collect::<VecDeque<_>>();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(idx) = ready.pop_front() {
            order.push(idx);
            for s in arena[idx].succ.iter() {
                let n = npred.get_mut(s)?;
                *n -= 1;
                if *n == 0 {
                    ready.push_back(*s);
                }
            }
        }
        (order.len() == self.nodes.len()).then_some(order)
    }
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("header", &self.header)
            .field("nodes", &self.nodes.len())
            .field("bufs", &self.bufs.len())
            .finish()
    }
}
