// vim: tw=80

//! Layout Manager
//!
//! Pure, stateless placement functions.  Given a volume's geometry and a
//! logical address, each layout computes the physical column and disk sector
//! holding it.  Nothing here performs I/O or blocks.
//!
//! Every stripe consists of `num_data_col` data units followed by
//! `num_check_col` check units: parity, Q, or a mirror copy.  The layouts
//! implement only [`Layout::map_unit`]; the sector-level functions are
//! derived from it.

use crate::{
    config::LayoutKind,
    types::*,
};

mod declustered;
mod mirror;
mod nonredundant;
mod pq;
mod prime_s;
mod raid5;
mod rotated_spare;

pub use self::declustered::DeclusteredPq;
pub use self::mirror::Mirror;
pub use self::nonredundant::Nonredundant;
pub use self::pq::Pq;
pub use self::raid5::{Raid4, Raid5};
pub use self::rotated_spare::Raid5RotatedSpare;

/// Kind of redundancy information kept by a layout
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Redundancy {
    /// None at all
    None,
    /// One full copy of each data unit
    Mirror,
    /// XOR parity
    Parity,
    /// XOR parity plus a Reed-Solomon Q syndrome
    Pq,
}

/// Physical shape of a volume's member disks
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Number of member disks, not counting dedicated spares
    pub num_col: ColT,
    /// Stripe unit size in sectors
    pub sectors_per_su: SectorT,
    /// Usable size of the smallest member disk, in sectors
    pub sectors_per_disk: SectorT,
}

impl Geometry {
    /// Number of whole stripe units that fit on each member disk
    pub fn rows(&self) -> u64 {
        self.sectors_per_disk / self.sectors_per_su
    }
}

/// Reject out-of-range stripe or unit numbers.
fn check_unit<L: Layout + ?Sized>(layout: &L, sid: StripeT, unit: u32)
    -> Result<()>
{
    if sid >= layout.num_stripes() || unit >= layout.stripe_width() {
        Err(Error::ERANGE)
    } else {
        Ok(())
    }
}

/// Placement algorithm of one redundancy layout
#[enum_dispatch::enum_dispatch(LayoutImpl)]
pub trait Layout {
    /// Does this layout relocate failed units into spare space that it
    /// manages itself?  If not, the volume substitutes a dedicated spare
    /// column for the failed one, and `remap` has no effect on the `map_*`
    /// functions.
    fn distributed_spare(&self) -> bool {
        false
    }

    fn geometry(&self) -> &Geometry;

    /// Locate unit `unit` of logical stripe `sid`.
    ///
    /// Units `[0, num_data_col)` are data; the rest are check units.  With
    /// `remap`, return the location that the unit's contents move to once its
    /// own disk fails.
    fn map_unit(&self, sid: StripeT, unit: u32, remap: bool)
        -> Result<PhysAddr>;

    /// Translate a logical stripe ID to a physical stripe ID and the
    /// reconstruction unit that owns the stripe's relocated data.
    ///
    /// Layouts that don't interleave spare space with data return `(sid, 0)`.
    fn map_sid_to_psid(&self, sid: StripeT) -> (StripeT, RuT) {
        (sid, 0)
    }

    /// Number of check units per stripe
    fn num_check_col(&self) -> u32;

    /// Number of data units per stripe
    fn num_data_col(&self) -> u32;

    /// Total number of logical stripes in the volume
    fn num_stripes(&self) -> StripeT;

    fn redundancy(&self) -> Redundancy;

    /// Usable size of the volume, in sectors
    fn capacity(&self) -> SectorT {
        self.num_stripes() * u64::from(self.num_data_col()) *
            self.geometry().sectors_per_su
    }

    /// How many unavailable units a stripe can lose and still be readable
    fn fault_tolerance(&self) -> u32 {
        self.num_check_col()
    }

    /// List the columns participating in the stripe containing `raid_sector`,
    /// in unit order.
    fn identify_stripe(&self, raid_sector: SectorT) -> Result<Vec<ColT>> {
        let (sid, _, _) = self.sector2stripe(raid_sector)?;
        self.stripe_cols(sid)
    }

    /// Locate the parity (or mirror copy) of `raid_sector`.
    fn map_parity(&self, raid_sector: SectorT, remap: bool)
        -> Result<Option<PhysAddr>>
    {
        let (sid, _, offset) = self.sector2stripe(raid_sector)?;
        if self.num_check_col() < 1 {
            return Ok(None);
        }
        let mut addr = self.map_unit(sid, self.num_data_col(), remap)?;
        addr.sector += offset;
        Ok(Some(addr))
    }

    /// Locate the Q syndrome of `raid_sector`, in dual-parity layouts.
    fn map_q(&self, raid_sector: SectorT, remap: bool)
        -> Result<Option<PhysAddr>>
    {
        let (sid, _, offset) = self.sector2stripe(raid_sector)?;
        if self.redundancy() != Redundancy::Pq {
            return Ok(None);
        }
        let mut addr = self.map_unit(sid, self.num_data_col() + 1, remap)?;
        addr.sector += offset;
        Ok(Some(addr))
    }

    /// Locate one sector of the volume.
    fn map_sector(&self, raid_sector: SectorT, remap: bool) -> Result<PhysAddr>
    {
        let (sid, unit, offset) = self.sector2stripe(raid_sector)?;
        let mut addr = self.map_unit(sid, unit, remap)?;
        addr.sector += offset;
        Ok(addr)
    }

    /// Split a volume sector into its stripe, data unit, and offset within
    /// that unit.
    fn sector2stripe(&self, raid_sector: SectorT)
        -> Result<(StripeT, u32, SectorT)>
    {
        if raid_sector >= self.capacity() {
            return Err(Error::ERANGE);
        }
        let spu = self.geometry().sectors_per_su;
        let suid = raid_sector / spu;
        let nd = u64::from(self.num_data_col());
        Ok((suid / nd, (suid % nd) as u32, raid_sector % spu))
    }

    /// Columns of every unit of stripe `sid`, in unit order
    fn stripe_cols(&self, sid: StripeT) -> Result<Vec<ColT>> {
        (0..self.stripe_width())
            .map(|u| self.map_unit(sid, u, false).map(|a| a.col))
            .collect()
    }

    /// Total units per stripe
    fn stripe_width(&self) -> u32 {
        self.num_data_col() + self.num_check_col()
    }
}

/// Every supported layout
#[derive(Clone, Debug)]
#[enum_dispatch::enum_dispatch]
pub enum LayoutImpl {
    Nonredundant(Nonredundant),
    Mirror(Mirror),
    Raid4(Raid4),
    Raid5(Raid5),
    Raid5RotatedSpare(Raid5RotatedSpare),
    Pq(Pq),
    DeclusteredPq(DeclusteredPq),
}

impl LayoutImpl {
    /// Construct the layout named by `kind` over `geom`.
    ///
    /// Fails with `EINVAL` if the geometry is unsuitable for the layout.
    pub fn new(kind: &LayoutKind, geom: Geometry) -> Result<Self> {
        if geom.sectors_per_su == 0 || geom.num_col == 0 || geom.rows() == 0 {
            return Err(Error::EINVAL);
        }
        Ok(match *kind {
            LayoutKind::Nonredundant => Nonredundant::new(geom)?.into(),
            LayoutKind::Mirror => Mirror::new(geom)?.into(),
            LayoutKind::Raid4 => Raid4::new(geom)?.into(),
            LayoutKind::Raid5 => Raid5::new(geom)?.into(),
            LayoutKind::Raid5RotatedSpare =>
                Raid5RotatedSpare::new(geom)?.into(),
            LayoutKind::Pq => Pq::new(geom)?.into(),
            LayoutKind::DeclusteredPq{disks_per_stripe, distributed_spare} =>
                DeclusteredPq::new(geom, disks_per_stripe, distributed_spare)?
                    .into(),
        })
    }
}

// LCOV_EXCL_START
#[cfg(test)]
mod t {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::collections::BTreeSet;
    use super::*;

    fn geom(num_col: ColT) -> Geometry {
        Geometry {num_col, sectors_per_su: 4, sectors_per_disk: 4 * 97}
    }

    fn declust(k: i16, distributed_spare: bool) -> LayoutKind {
        LayoutKind::DeclusteredPq{disks_per_stripe: k, distributed_spare}
    }

    #[rstest]
    #[case(LayoutKind::Nonredundant, 3)]
    #[case(LayoutKind::Mirror, 4)]
    #[case(LayoutKind::Raid4, 5)]
    #[case(LayoutKind::Raid5, 4)]
    #[case(LayoutKind::Raid5, 7)]
    #[case(LayoutKind::Raid5RotatedSpare, 5)]
    #[case(LayoutKind::Pq, 6)]
    #[case(declust(5, false), 7)]
    #[case(declust(4, true), 7)]
    #[case(declust(5, false), 5)]
    fn mapping_properties(#[case] kind: LayoutKind, #[case] n: ColT) {
        let g = geom(n);
        let layout = LayoutImpl::new(&kind, g).unwrap();
        let spu = g.sectors_per_su;
        for s in 0..layout.capacity() {
            // Stable and in bounds
            let a = layout.map_sector(s, false).unwrap();
            assert_eq!(a, layout.map_sector(s, false).unwrap());
            assert!(a.col < n);
            assert!(a.sector < g.sectors_per_disk);

            // No check unit shares a column with a data unit of its stripe
            let cols = layout.identify_stripe(s).unwrap();
            let nd = layout.num_data_col() as usize;
            let distinct = cols.iter().collect::<BTreeSet<_>>();
            assert_eq!(distinct.len(), cols.len());
            assert!(cols[..nd].contains(&a.col));
            if let Some(p) = layout.map_parity(s, false).unwrap() {
                assert!(!cols[..nd].contains(&p.col));
                assert_eq!(p.sector % spu, a.sector % spu);
            }
            if let Some(q) = layout.map_q(s, false).unwrap() {
                assert!(!cols[..nd].contains(&q.col));
                assert_ne!(Some(q.col),
                           layout.map_parity(s, false).unwrap().map(|p| p.col));
            }
        }
    }

    /// No two units of the volume share a physical location, even when
    /// spare space is counted.
    #[rstest]
    #[case(LayoutKind::Nonredundant, 3)]
    #[case(LayoutKind::Mirror, 6)]
    #[case(LayoutKind::Raid4, 4)]
    #[case(LayoutKind::Raid5, 5)]
    #[case(LayoutKind::Raid5RotatedSpare, 4)]
    #[case(LayoutKind::Pq, 5)]
    #[case(declust(5, false), 7)]
    #[case(declust(4, true), 5)]
    fn injective(#[case] kind: LayoutKind, #[case] n: ColT) {
        let layout = LayoutImpl::new(&kind, geom(n)).unwrap();
        let mut seen = BTreeSet::new();
        for sid in 0..layout.num_stripes() {
            for u in 0..layout.stripe_width() {
                let a = layout.map_unit(sid, u, false).unwrap();
                assert!(seen.insert(a), "{a:?} used twice");
            }
        }
        if layout.distributed_spare() {
            // Spare locations are disjoint from primary ones, and each stripe
            // relocates into a column outside of itself.
            let mut spares = BTreeSet::new();
            for sid in 0..layout.num_stripes() {
                let cols = layout.stripe_cols(sid).unwrap();
                let a = layout.map_unit(sid, 0, true).unwrap();
                assert!(!cols.contains(&a.col));
                assert!(!seen.contains(&a));
                spares.insert(a);
            }
            assert_eq!(spares.len() as u64, layout.num_stripes());
        }
    }

    #[rstest]
    #[case(LayoutKind::Raid5RotatedSpare, 5)]
    #[case(declust(4, true), 7)]
    #[case(declust(5, false), 7)]
    #[case(LayoutKind::Raid5, 4)]
    fn psid_monotonic(#[case] kind: LayoutKind, #[case] n: ColT) {
        let layout = LayoutImpl::new(&kind, geom(n)).unwrap();
        let mut last = (0, 0);
        for sid in 0..layout.num_stripes() {
            let (psid, ru) = layout.map_sid_to_psid(sid);
            assert!(psid >= sid);
            assert!(psid >= last.0);
            assert_ne!((psid, ru), last, "stripe {sid} aliases its predecessor");
            last = (psid, ru);
        }
    }

    #[test]
    fn psid_declustered() {
        let layout = LayoutImpl::new(&declust(4, true), geom(7)).unwrap();
        assert_eq!(layout.map_sid_to_psid(0), (0, 0));
        assert_eq!(layout.map_sid_to_psid(6), (6, 6));
        assert_eq!(layout.map_sid_to_psid(7), (8, 0));
        assert_eq!(layout.map_sid_to_psid(20), (22, 6));
    }

    #[test]
    fn out_of_range() {
        let layout = LayoutImpl::new(&LayoutKind::Raid5, geom(4)).unwrap();
        let cap = layout.capacity();
        assert_eq!(cap, 97 * 3 * 4);
        assert_eq!(layout.map_sector(cap, false), Err(Error::ERANGE));
        assert_eq!(layout.map_parity(cap, false), Err(Error::ERANGE));
        assert_eq!(layout.map_unit(97, 0, false), Err(Error::ERANGE));
        assert_eq!(layout.map_unit(0, 4, false), Err(Error::ERANGE));
    }

    #[rstest]
    #[case(LayoutKind::Mirror, 3)]
    #[case(LayoutKind::Raid5, 2)]
    #[case(LayoutKind::Raid5RotatedSpare, 3)]
    #[case(LayoutKind::Pq, 3)]
    #[case(declust(4, false), 6)]
    #[case(declust(7, true), 7)]
    fn invalid_geometry(#[case] kind: LayoutKind, #[case] n: ColT) {
        assert_eq!(LayoutImpl::new(&kind, geom(n)).unwrap_err(), Error::EINVAL);
    }

    #[test]
    fn zero_stripe_unit() {
        let g = Geometry{num_col: 4, sectors_per_su: 0, sectors_per_disk: 64};
        assert_eq!(LayoutImpl::new(&LayoutKind::Raid5, g).unwrap_err(),
                   Error::EINVAL);
    }

    #[test]
    fn map_q_only_for_pq() {
        let layout = LayoutImpl::new(&LayoutKind::Raid5, geom(4)).unwrap();
        assert_eq!(layout.map_q(0, false), Ok(None));
        let layout = LayoutImpl::new(&LayoutKind::Nonredundant, geom(4))
            .unwrap();
        assert_eq!(layout.map_parity(0, false), Ok(None));
        assert_eq!(layout.fault_tolerance(), 0);
    }
}
// LCOV_EXCL_STOP
