// vim: tw=80
//! Access stripe maps
//!
//! An access to the volume is split at stripe boundaries.  Each piece is
//! described by an [`AccessStripeMap`]: which data units it touches, over
//! which sector ranges, and where every unit of the stripe currently lives.

use fixedbitset::FixedBitSet;

use crate::{
    layout::*,
    types::*,
};

/// Availability of one stripe unit, as seen by one access
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnitHealth {
    Healthy,
    /// The unit's disk failed, but its contents were rebuilt onto spare space
    Relocated,
    /// The unit's contents are unavailable
    Failed,
}

/// Current location of one unit of a stripe
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UnitMap {
    /// Where to find the unit's first sector.  For a relocated unit, that's
    /// the spare location.
    pub addr: PhysAddr,
    pub health: UnitHealth,
}

impl UnitMap {
    pub fn is_available(&self) -> bool {
        self.health != UnitHealth::Failed
    }
}

/// A run of sectors within one data unit touched by an access
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DataRange {
    pub unit: u32,
    /// First sector, relative to the start of the unit
    pub start: SectorT,
    pub len: SectorT,
    /// Offset of the run within the stripe's portion of the access buffer
    pub buf_off: SectorT,
}

impl DataRange {
    pub fn end(&self) -> SectorT {
        self.start + self.len
    }
}

/// The part of one access that falls within a single stripe
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessStripeMap {
    pub sid: StripeT,
    pub psid: StripeT,
    pub which_ru: RuT,
    /// Number of data units in the stripe
    pub nd: u32,
    pub sectors_per_su: SectorT,
    /// Every unit of the stripe, data units first
    pub units: Vec<UnitMap>,
    /// Touched data, in ascending unit order
    pub ranges: Vec<DataRange>,
    /// Offset of this stripe's portion within the whole access, in sectors
    pub access_off: SectorT,
}

impl AccessStripeMap {
    /// Set of unavailable units
    pub fn failed(&self) -> FixedBitSet {
        let mut fbs = FixedBitSet::with_capacity(self.units.len());
        for (i, u) in self.units.iter().enumerate() {
            fbs.set(i, !u.is_available());
        }
        fbs
    }

    /// Does the access overwrite every data unit in its entirety?
    pub fn is_full_stripe(&self) -> bool {
        self.ranges.len() == self.nd as usize &&
            self.ranges.iter().all(|r| r.start == 0 &&
                                   r.len == self.sectors_per_su)
    }

    /// Total length of the access within this stripe
    pub fn len(&self) -> SectorT {
        self.ranges.iter().map(|r| r.len).sum()
    }

    pub fn nfailed(&self) -> u32 {
        self.units.iter().filter(|u| !u.is_available()).count() as u32
    }

    /// Smallest range within a unit that covers every touched range
    pub fn union_range(&self) -> (SectorT, SectorT) {
        let start = self.ranges.iter().map(|r| r.start).min().unwrap_or(0);
        let end = self.ranges.iter().map(DataRange::end).max().unwrap_or(0);
        (start, end)
    }

    /// Location of `sector` within unit `unit`
    pub fn unit_addr(&self, unit: u32, sector: SectorT) -> PhysAddr {
        let base = self.units[unit as usize].addr;
        PhysAddr::new(base.col, base.sector + sector)
    }
}

/// Split an access of `nsectors` at volume sector `sector` into stripes.
///
/// `resolve` reports the current location and health of a unit, given its
/// stripe, unit number, and primary address.
pub fn map_access<L, F>(layout: &L, sector: SectorT, nsectors: SectorT,
                        mut resolve: F)
    -> Result<Vec<AccessStripeMap>>
    where L: Layout + ?Sized,
          F: FnMut(StripeT, u32, PhysAddr) -> Result<UnitMap>
{
    let end = sector.checked_add(nsectors).ok_or(Error::ERANGE)?;
    if end > layout.capacity() {
        return Err(Error::ERANGE);
    }
    let spu = layout.geometry().sectors_per_su;
    let nd = layout.num_data_col();
    let stripe_sectors = spu * u64::from(nd);
    let mut asms = Vec::new();
    let mut cur = sector;
    while cur < end {
        let sid = cur / stripe_sectors;
        let stripe_start = sid * stripe_sectors;
        let stripe_end = (stripe_start + stripe_sectors).min(end);
        let (psid, which_ru) = layout.map_sid_to_psid(sid);
        let units = (0..layout.stripe_width())
            .map(|u| {
                let addr = layout.map_unit(sid, u, false)?;
                resolve(sid, u, addr)
            }).collect::<Result<Vec<_>>>()?;
        let mut ranges = Vec::new();
        for u in 0..nd {
            let ustart = stripe_start + u64::from(u) * spu;
            let uend = ustart + spu;
            let rstart = cur.max(ustart);
            let rend = stripe_end.min(uend);
            if rstart < rend {
                ranges.push(DataRange {
                    unit: u,
                    start: rstart - ustart,
                    len: rend - rstart,
                    buf_off: rstart - cur,
                });
            }
        }
        asms.push(AccessStripeMap {
            sid, psid, which_ru, nd,
            sectors_per_su: spu,
            units,
            ranges,
            access_off: cur - sector,
        });
        cur = stripe_end;
    }
    Ok(asms)
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use crate::config::LayoutKind;
    use super::*;

    fn healthy(_: StripeT, _: u32, addr: PhysAddr) -> Result<UnitMap> {
        Ok(UnitMap{addr, health: UnitHealth::Healthy})
    }

    fn raid5() -> LayoutImpl {
        let geom = Geometry{num_col: 4, sectors_per_su: 4, sectors_per_disk: 64};
        LayoutImpl::new(&LayoutKind::Raid5, geom).unwrap()
    }

    #[test]
    fn single_range() {
        let asms = map_access(&raid5(), 5, 2, healthy).unwrap();
        assert_eq!(asms.len(), 1);
        let asm = &asms[0];
        assert_eq!(asm.sid, 0);
        assert_eq!(asm.ranges, vec![
            DataRange{unit: 1, start: 1, len: 2, buf_off: 0}
        ]);
        assert!(!asm.is_full_stripe());
        assert_eq!(asm.unit_addr(1, 1), PhysAddr::new(1, 1));
    }

    /// An access spanning a stripe boundary is split, and the pieces remember
    /// their offsets within the whole access.
    #[test]
    fn spans_stripes() {
        let asms = map_access(&raid5(), 10, 6, healthy).unwrap();
        assert_eq!(asms.len(), 2);
        assert_eq!(asms[0].sid, 0);
        assert_eq!(asms[0].ranges, vec![
            DataRange{unit: 2, start: 2, len: 2, buf_off: 0}
        ]);
        assert_eq!(asms[1].sid, 1);
        assert_eq!(asms[1].access_off, 2);
        assert_eq!(asms[1].ranges, vec![
            DataRange{unit: 0, start: 0, len: 4, buf_off: 0}
        ]);
        assert_eq!(asms[1].union_range(), (0, 4));
    }

    #[test]
    fn full_stripe() {
        let asms = map_access(&raid5(), 12, 12, healthy).unwrap();
        assert_eq!(asms.len(), 1);
        assert!(asms[0].is_full_stripe());
        assert_eq!(asms[0].len(), 12);
    }

    #[test]
    fn out_of_range() {
        let layout = raid5();
        let cap = layout.capacity();
        assert_eq!(map_access(&layout, cap - 1, 2, healthy), Err(Error::ERANGE));
        assert_eq!(map_access(&layout, u64::MAX, 2, healthy),
                   Err(Error::ERANGE));
    }

    #[test]
    fn failed_units() {
        let asms = map_access(&raid5(), 0, 1, |_, _, addr| {
            let health = if addr.col == 2 {
                UnitHealth::Failed
            } else {
                UnitHealth::Healthy
            };
            Ok(UnitMap{addr, health})
        }).unwrap();
        assert_eq!(asms[0].nfailed(), 1);
        assert_eq!(asms[0].failed().ones().collect::<Vec<_>>(), vec![2]);
    }
}
// LCOV_EXCL_STOP
