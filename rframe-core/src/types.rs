// vim: tw=80
//! Common type definitions used throughout the RAID engine

use divbuf::{DivBuf, DivBufMut};
use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;
use serde_derive::{Deserialize, Serialize};
use serde::{
    ser::{Serialize, Serializer},
    de::{Deserialize, Deserializer},
    ser::SerializeTuple
};
use thiserror::Error;
use std::{
    fmt::{self, Display, Formatter},
    io,
};

/// Indexes a column (a member or spare disk) of a `RaidVolume`.  Spares are
/// numbered after the members.
pub type ColT = u16;

/// Our `IoVec`.  Unlike the standard library's, ours is reference-counted so it
/// can have more than one owner.
pub type IoVec = DivBuf;

/// Mutable version of `IoVec`.  Uniquely owned.
pub type IoVecMut = DivBufMut;

/// Indexes a 512-byte sector, either of the volume or of a single disk.
pub type SectorT = u64;

/// Logical or physical stripe number
pub type StripeT = u64;

/// Identifies one reconstruction unit within a physical stripe
pub type RuT = u32;

/// The RAID engine's error type.  Basically just an errno
#[derive(Clone, Copy, Debug, Deserialize, Error, Eq, PartialEq, Primitive, Serialize)]
pub enum Error {
    #[error("Input/output error")]
    EIO             = libc::EIO as isize,
    #[error("Device not configured")]
    ENXIO           = libc::ENXIO as isize,
    #[error("Device busy")]
    EBUSY           = libc::EBUSY as isize,
    #[error("Invalid argument")]
    EINVAL          = libc::EINVAL as isize,
    #[error("No space left on device")]
    ENOSPC          = libc::ENOSPC as isize,
    #[error("Broken pipe")]
    EPIPE           = libc::EPIPE as isize,
    #[error("Result too large")]
    ERANGE          = libc::ERANGE as isize,
    #[error("Resource temporarily unavailable")]
    EAGAIN          = libc::EAGAIN as isize,
    #[error("Operation already in progress")]
    EALREADY        = libc::EALREADY as isize,
    #[error("Operation timed out")]
    ETIMEDOUT       = libc::ETIMEDOUT as isize,

    //// Custom error types below
    #[error("Unknown error")]
    EUNKNOWN        = 256,
}

impl Error {
    /// Should the Disk Queue retry an operation that failed this way?
    ///
    /// `ENXIO` means the device is gone, and retrying won't bring it back.
    pub fn is_transient(self) -> bool {
        matches!(self, Error::EIO | Error::ETIMEDOUT | Error::EAGAIN)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        e.raw_os_error()
            .and_then(Error::from_i32)
            .unwrap_or(Error::EUNKNOWN)
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;

/// Location of one stripe unit (or part of one) on a physical disk
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, Hash, Ord,
         PartialEq, PartialOrd)]
pub struct PhysAddr {
    pub col: ColT,
    pub sector: SectorT
}

impl PhysAddr {
    pub fn new(col: ColT, sector: SectorT) -> Self {
        PhysAddr {col, sector}
    }
}

/// Volume UUID type
///
/// This is just like the `Uuid` from the `uuid` crate, except that it
/// serializes as a fixed-size array instead of a slice
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Uuid(uuid::Uuid);

impl Uuid {
    pub fn new_v4() -> Self {
        Uuid(uuid::Uuid::new_v4())
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
        where D: Deserializer<'de>
    {
        <[u8; 16]>::deserialize(deserializer)
        .map(|v| Uuid(uuid::Uuid::from_bytes(v)))
    }
}

impl Display for Uuid {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Serialize for Uuid {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
        where S: Serializer
    {
        let bytes = self.0.as_bytes();
        debug_assert_eq!(bytes.len(), 16);
        let mut tup = serializer.serialize_tuple(16)?;
        for b in bytes.iter() {
            tup.serialize_element(&b)?;
        }
        tup.end()
    }
}

// LCOV_EXCL_STOP
