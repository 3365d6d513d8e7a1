// vim: tw=80
//! Common utility functions used throughout the RAID engine

use divbuf::DivBufShared;
use std::ops::{Add, Div, Sub};

/// The volume and every member disk are addressed in 512-byte sectors.
pub const BYTES_PER_SECTOR: usize = 512;

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1)) / divisor
}

/// Allocate a zero-filled buffer of `nsectors` sectors
pub fn zeroed_sectors(nsectors: u64) -> DivBufShared {
    DivBufShared::from(vec![0u8; nsectors as usize * BYTES_PER_SECTOR])
}

/// Byte length of `nsectors` sectors
pub fn sectors2bytes(nsectors: u64) -> usize {
    nsectors as usize * BYTES_PER_SECTOR
}

/// XOR `src` into `dst`, in place.  The slices must be the same length.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

// LCOV_EXCL_STOP
