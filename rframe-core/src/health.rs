// vim: tw=80
//! Health of a `RaidVolume` and of its individual columns

use std::{
    fmt,
    num::NonZeroU8,
};
use serde_derive::{Deserialize, Serialize};
use crate::types::*;

/// Represents the state of a whole volume
///
/// The ordering reflects which state is "sicker".  That is, a degraded volume
/// is sicker than an optimal one, a doubly-degraded volume is sicker than a
/// singly-degraded one, etc.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, PartialOrd, Ord, Serialize)]
pub enum VolumeState {
    /// Every column is healthy, or has been fully rebuilt onto a spare
    Optimal,
    /// Operating with reduced redundancy.  The count is the number of columns
    /// whose contents are not available.
    Degraded(NonZeroU8),
    /// A rebuild is in progress.  Still serviceable, but with reduced
    /// redundancy.
    Reconstructing,
    /// More columns have failed than the layout can tolerate.  No I/O is
    /// possible.
    Failed,
}

impl VolumeState {
    /// If this volume is degraded, how many levels of redundancy is it missing?
    pub fn as_degraded(self) -> Option<NonZeroU8> {
        if let VolumeState::Degraded(d) = self {
            Some(d)
        } else {
            None
        }
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Optimal => "Optimal".fmt(f),
            Self::Degraded(n) => write!(f, "Degraded({})", n),
            Self::Reconstructing => "Reconstructing".fmt(f),
            Self::Failed => "Failed".fmt(f),
        }
    }
}

/// Status of one column of a volume
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DiskStatus {
    /// Healthy member
    Optimal,
    /// Failed, and nothing has been done about it yet
    Failed,
    /// Failed, and being rebuilt.  The `Option` names the dedicated spare
    /// receiving the data, if any.  `None` means distributed spare space.
    Reconstructing(Option<ColT>),
    /// Failed, and fully rebuilt onto spare space.
    Spared(Option<ColT>),
    /// A dedicated spare that has not been used
    Spare,
    /// A dedicated spare that has absorbed a failed member
    UsedSpare,
}

impl DiskStatus {
    /// Is this column's original content unavailable, at least in part?
    pub fn is_failed(self) -> bool {
        matches!(self, DiskStatus::Failed | DiskStatus::Reconstructing(_))
    }
}

impl fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Optimal => "Optimal".fmt(f),
            Self::Failed => "Failed".fmt(f),
            Self::Reconstructing(Some(c)) => write!(f, "Reconstructing({})", c),
            Self::Reconstructing(None) => "Reconstructing".fmt(f),
            Self::Spared(Some(c)) => write!(f, "Spared({})", c),
            Self::Spared(None) => "Spared".fmt(f),
            Self::Spare => "Spare".fmt(f),
            Self::UsedSpare => "UsedSpare".fmt(f),
        }
    }
}

/// Notifications emitted by a `RaidVolume` for the fault-management layer
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VolumeEvent {
    DiskFailed(ColT),
    ReconstructionComplete(ColT),
    ReconstructionFailed(ColT),
    VolumeFailed,
}
