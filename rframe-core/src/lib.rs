// vim: tw=80
//! A RAID engine in the style of RAIDframe
//!
//! A [`volume::RaidVolume`] presents an array of [`disk::Disk`]s as one
//! virtual block device.  Every access is planned as a small DAG of disk and
//! parity operations, chosen according to the health of the stripes it
//! touches, and failed disks may be rebuilt onto spare space while the volume
//! remains online.

// I don't find this lint very helpful
#![allow(clippy::type_complexity)]

// I use a common pattern to substitute mock objects for real ones in test
// builds.  Silence clippy's complaints.
#![allow(clippy::module_inception)]

// I suppose I should probably fix this some day, but I just don't like the look
// of e.g. "Asm" as opposed to "ASM".
#![allow(clippy::upper_case_acronyms)]

pub mod asm;
pub mod codec;
pub mod config;
pub mod dag;
pub mod disk;
pub mod disk_queue;
pub mod health;
pub mod layout;
pub mod recon;
pub mod stripe_lock;
pub mod types;
pub mod util;
pub mod volume;

pub use crate::types::*;
pub use crate::util::*;
