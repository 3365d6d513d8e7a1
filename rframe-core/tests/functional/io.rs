// vim: tw=80
//! Reads and writes through whole volumes, with and without failed disks
use pretty_assertions::assert_eq;
use rstest::rstest;

use rframe_core::{
    *,
    config::LayoutKind,
    health::VolumeState,
};

use super::*;

fn declust(k: i16, distributed_spare: bool) -> LayoutKind {
    LayoutKind::DeclusteredPq{disks_per_stripe: k, distributed_spare}
}

/// Write the whole volume, overwrite a few small pieces, and read it back.
/// Then lose as many disks as the layout can tolerate and do it again.
#[rstest]
#[case(LayoutKind::Raid4, 5, &[2])]
#[case(LayoutKind::Raid5, 4, &[1])]
#[case(LayoutKind::Raid5, 7, &[6])]
#[case(LayoutKind::Raid5RotatedSpare, 5, &[3])]
#[case(LayoutKind::Pq, 6, &[0, 4])]
#[case(LayoutKind::Mirror, 4, &[0, 3])]
#[case(declust(5, false), 7, &[1, 5])]
#[case(declust(4, true), 7, &[2, 6])]
#[tokio::test]
async fn round_trip(#[case] kind: LayoutKind, #[case] n: usize,
                    #[case] fail: &[ColT])
{
    let (vol, mds) = VolumeBuilder::new(kind).disks(n).build();
    let cap = vol.capacity();
    let mut model = random_data(1, cap);
    t!(write(&vol, 0, &model).await);

    // Small writes within one unit, and spanning a stripe boundary
    for (i, (sector, len)) in [(5, 3), (cap / 2 - 2, 5), (cap - 1, 1)]
        .into_iter()
        .enumerate()
    {
        let data = random_data(2 + i as u8, len);
        t!(write(&vol, sector, &data).await);
        let start = sectors2bytes(sector);
        model[start..start + data.len()].copy_from_slice(&data);
    }
    assert_eq!(t!(read(&vol, 0, cap).await), model);

    for col in fail.iter() {
        t!(vol.mark_disk_failed(*col));
        mds[usize::from(*col)].kill();
    }
    assert!(matches!(vol.state(), VolumeState::Degraded(_)));
    assert_eq!(t!(read(&vol, 0, cap).await), model);

    // Degraded writes
    let data = random_data(9, 7);
    t!(write(&vol, 10, &data).await);
    model[sectors2bytes(10)..sectors2bytes(17)].copy_from_slice(&data);
    assert_eq!(t!(read(&vol, 0, cap).await), model);
}

#[test_log::test(tokio::test)]
async fn nonredundant() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Nonredundant)
        .disks(3)
        .build();
    let cap = vol.capacity();
    assert_eq!(cap, 3 * DISK_SECTORS);
    let model = random_data(1, cap);
    t!(write(&vol, 0, &model).await);
    assert_eq!(t!(read(&vol, 0, cap).await), model);
    // Striped in 4-sector units across the disks
    assert_eq!(mds[1].contents(0, 4),
               &model[sectors2bytes(4)..sectors2bytes(8)]);
}

/// A degraded read returns exactly what a fault-free read did
#[test_log::test(tokio::test)]
async fn degraded_read_matches() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).build();
    let data = random_data(3, 48);
    t!(write(&vol, 0, &data).await);
    let before = t!(read(&vol, 3, 41).await);
    t!(vol.mark_disk_failed(2));
    mds[2].kill();
    let after = t!(read(&vol, 3, 41).await);
    assert_eq!(before, after);
    assert_eq!(&after[..], &data[sectors2bytes(3)..sectors2bytes(44)]);
}

#[test_log::test(tokio::test)]
async fn empty_access() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).build();
    assert_eq!(t!(read(&vol, 0, 0).await), Vec::<u8>::new());
    t!(write(&vol, vol.capacity(), &[]).await);
    assert!(mds.iter().all(|md| md.reads() == 0 && md.writes() == 0));
}

/// Both halves of a mirror hold every write, and either can serve reads
#[test_log::test(tokio::test)]
async fn mirror_copies() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Mirror).disks(2).build();
    let data = random_data(4, 64);
    t!(write(&vol, 0, &data).await);
    assert_eq!(mds[0].contents(0, 64), data);
    assert_eq!(mds[1].contents(0, 64), data);
    mds[0].kill();
    t!(vol.mark_disk_failed(0));
    assert_eq!(t!(read(&vol, 0, 64).await), data);
    assert_eq!(mds[0].reads(), 0);
}
