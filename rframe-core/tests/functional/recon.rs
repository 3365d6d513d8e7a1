// vim: tw=80
//! Rebuilding failed disks while the volume stays online
use std::{pin::pin, time::Duration};

use futures::StreamExt;
use pretty_assertions::assert_eq;
use rstest::rstest;

use rframe_core::{
    *,
    config::LayoutKind,
    health::{DiskStatus, VolumeEvent, VolumeState},
};

use super::*;

/// Fill the volume with pseudorandom data, and return a copy of it
async fn fill(vol: &RaidVolume) -> Vec<u8> {
    let model = random_data(1, vol.capacity());
    t!(write(vol, 0, &model).await);
    model
}

/// Lose a disk the way a fault-management layer would see it
fn lose(vol: &RaidVolume, mds: &[MemDisk], col: ColT) {
    mds[usize::from(col)].kill();
    t!(vol.mark_disk_failed(col));
}

/// Rebuild a RAID-5 member onto a dedicated spare.  The spare ends up with
/// exactly the contents the lost disk had.
#[test_log::test(tokio::test)]
async fn dedicated_spare() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5)
        .stripe_unit(1)
        .spares(1)
        .build();
    let mut events = vol.subscribe();
    let mut model = fill(&vol).await;
    let stripe0 = [[0xAAu8; 512], [0xBB; 512], [0xCC; 512]].concat();
    t!(write(&vol, 0, &stripe0).await);
    model[..stripe0.len()].copy_from_slice(&stripe0);
    let holding = |b: u8| mds[..4].iter()
        .position(|md| md.contents(0, 1) == [b; 512])
        .unwrap() as ColT;
    // Parity is 0xAA ^ 0xBB ^ 0xCC
    holding(0xDD);
    let col = holding(0xBB);
    let lost = mds[usize::from(col)].contents(0, DISK_SECTORS);

    lose(&vol, &mds, col);
    t!(vol.reconstruct(col).await);

    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(col)));
    assert_eq!(events.next().await,
               Some(VolumeEvent::ReconstructionComplete(col)));
    assert_eq!(vol.state(), VolumeState::Optimal);
    assert_eq!(vol.disk_status(col), Some(DiskStatus::Spared(Some(4))));
    assert_eq!(vol.disk_status(4), Some(DiskStatus::UsedSpare));
    assert_eq!(vol.recon_cursor(col), None);
    assert_eq!(mds[4].contents(0, 1), [0xBB; 512]);
    assert_eq!(mds[4].contents(0, DISK_SECTORS), lost);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);

    // The rebuilt copy participates in parity like any other member
    let other = (col + 1) % 4;
    lose(&vol, &mds, other);
    assert_eq!(vol.state().as_degraded().map(|n| n.get()), Some(1));
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
}

/// Rebuild onto spare space scattered among the surviving members
#[rstest]
#[case(LayoutKind::Raid5RotatedSpare, 5, 1, 3)]
#[case(LayoutKind::DeclusteredPq{disks_per_stripe: 4, distributed_spare: true},
       7, 2, 5)]
#[tokio::test]
async fn distributed_spare(#[case] kind: LayoutKind, #[case] n: usize,
                           #[case] first: ColT, #[case] second: ColT)
{
    let (vol, mds) = VolumeBuilder::new(kind).disks(n).build();
    let model = fill(&vol).await;
    lose(&vol, &mds, first);
    t!(vol.reconstruct(first).await);
    assert_eq!(vol.disk_status(first), Some(DiskStatus::Spared(None)));
    assert_eq!(vol.state(), VolumeState::Optimal);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);

    // Each stripe's spare unit lies outside of the stripe, so one more
    // failure is still survivable
    lose(&vol, &mds, second);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
    // But there's no spare space left to rebuild it
    assert_eq!(vol.reconstruct(second).await, Err(Error::ENOSPC));
}

/// Reconstruction can't get too far ahead of a slow disk
#[test_log::test(tokio::test)]
async fn head_separation() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5)
        .spares(1)
        .floating_buffers(64)
        .head_sep_limit(4)
        .build();
    let model = fill(&vol).await;
    lose(&vol, &mds, 0);
    mds[2].stall();

    let mut recon = pin!(vol.reconstruct(0));
    let r = tokio::time::timeout(Duration::from_millis(200), recon.as_mut())
        .await;
    assert!(r.is_err(), "Reconstruction finished despite a stalled disk");
    assert_eq!(vol.recon_cursor(0), Some(4));
    assert_eq!(vol.state(), VolumeState::Reconstructing);

    mds[2].resume();
    t!(recon.await);
    assert_eq!(vol.disk_status(0), Some(DiskStatus::Spared(Some(4))));
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
}

/// A foreground read of a stripe whose rebuild is still queued moves the
/// rebuild's reads to the front of each disk's queue
#[test_log::test(tokio::test)]
async fn read_promotes_rebuild() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5)
        .spares(1)
        .floating_buffers(64)
        .head_sep_limit(8)
        .queue_depth(1)
        .build();
    let model = fill(&vol).await;
    lose(&vol, &mds, 0);
    let before = mds[2].read_log().len();
    mds[2].stall();

    let mut recon = pin!(vol.reconstruct(0));
    let r = tokio::time::timeout(Duration::from_millis(100), recon.as_mut())
        .await;
    assert!(r.is_err());
    assert_eq!(vol.recon_cursor(0), Some(8));
    // Only one read at a time is issued to the stalled disk.  The others wait
    // in its queue, in stripe order.
    let log = mds[2].read_log();
    assert_eq!(log.len(), before + 1);
    let sid = (1..8).rev().find(|s| s * 4 != log[before]).unwrap();

    let stripe_sectors = 12;
    let mut rd = pin!(read(&vol, sid * stripe_sectors, stripe_sectors));
    let r = tokio::time::timeout(Duration::from_millis(50), rd.as_mut()).await;
    assert!(r.is_err(), "Read finished before its stripe was rebuilt");

    mds[2].resume();
    let (r, data) = futures::join!(recon, rd);
    t!(r);
    let start = sectors2bytes(sid * stripe_sectors);
    assert_eq!(t!(data), &model[start..start + sectors2bytes(stripe_sectors)]);
    // The promoted rebuild read was the next one issued
    assert_eq!(mds[2].read_log()[before + 1], sid * 4);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
}

/// Foreground writes to stripes that haven't been rebuilt yet
#[test_log::test(tokio::test)]
async fn write_during_rebuild() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5)
        .spares(1)
        .floating_buffers(1)
        .build();
    let mut model = fill(&vol).await;
    lose(&vol, &mds, 0);

    let new = random_data(5, 30);
    let (r, w) = futures::join!(vol.reconstruct(0), write(&vol, 100, &new));
    t!(r);
    t!(w);
    model[sectors2bytes(100)..sectors2bytes(130)].copy_from_slice(&new);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);

    // Parity and the rebuilt copy agree with the new data
    lose(&vol, &mds, 2);
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
}

/// Two failures in a dual-parity volume, rebuilt at the same time
#[test_log::test(tokio::test)]
async fn two_rebuilds() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Pq)
        .disks(6)
        .spares(2)
        .build();
    let model = fill(&vol).await;
    lose(&vol, &mds, 1);
    lose(&vol, &mds, 3);
    let (r1, r3) = futures::join!(vol.reconstruct(1), vol.reconstruct(3));
    t!(r1);
    t!(r3);
    assert_eq!(vol.state(), VolumeState::Optimal);
    // Spares are claimed in order
    assert_eq!(vol.disk_status(1), Some(DiskStatus::Spared(Some(6))));
    assert_eq!(vol.disk_status(3), Some(DiskStatus::Spared(Some(7))));
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
}

/// Losing the spare mid-rebuild fails the rebuild, but not the volume
#[test_log::test(tokio::test)]
async fn spare_dies() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).spares(1).build();
    let mut events = vol.subscribe();
    let model = fill(&vol).await;
    lose(&vol, &mds, 0);
    mds[4].kill();

    assert_eq!(vol.reconstruct(0).await, Err(Error::ENXIO));
    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(0)));
    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(4)));
    assert_eq!(events.next().await,
               Some(VolumeEvent::ReconstructionFailed(0)));
    assert_eq!(vol.disk_status(0), Some(DiskStatus::Failed));
    assert_eq!(vol.disk_status(4), Some(DiskStatus::Failed));
    assert_eq!(vol.state().as_degraded().map(|n| n.get()), Some(1));
    assert_eq!(t!(read(&vol, 0, vol.capacity()).await), model);
    assert_eq!(vol.reconstruct(0).await, Err(Error::ENOSPC));
}

#[test_log::test(tokio::test)]
async fn already_rebuilding() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5)
        .spares(2)
        .build();
    lose(&vol, &mds, 0);
    mds[1].stall();
    let mut recon = pin!(vol.reconstruct(0));
    let r = tokio::time::timeout(Duration::from_millis(50), recon.as_mut())
        .await;
    assert!(r.is_err());
    assert_eq!(vol.reconstruct(0).await, Err(Error::EALREADY));
    mds[1].resume();
    t!(recon.await);
}
