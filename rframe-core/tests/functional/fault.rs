// vim: tw=80
//! Disk failures discovered by I/O, and the volume's reaction to them
use futures::StreamExt;
use pretty_assertions::assert_eq;

use rframe_core::{
    *,
    config::LayoutKind,
    health::{DiskStatus, VolumeEvent, VolumeState},
};

use super::*;

/// Errors that the Disk Queue's retries absorb are invisible to the caller
#[test_log::test(tokio::test)]
async fn transient_errors_hidden() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).build();
    let data = random_data(1, 24);
    mds[1].fail_next(2);
    t!(write(&vol, 0, &data).await);
    mds[2].fail_next(2);
    assert_eq!(t!(read(&vol, 0, 24).await), data);
    assert_eq!(vol.state(), VolumeState::Optimal);
    assert_eq!(vol.disk_status(1), Some(DiskStatus::Optimal));
}

/// An access that finds a dead disk fails with `EAGAIN`, and the disk is
/// marked failed.  A retry succeeds in degraded mode.
#[test_log::test(tokio::test)]
async fn persistent_error() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).build();
    let mut events = vol.subscribe();
    let data = random_data(1, 24);
    t!(write(&vol, 0, &data).await);

    mds[1].fail_next(100);
    assert_eq!(read(&vol, 0, 24).await, Err(Error::EAGAIN));
    assert_eq!(vol.disk_status(1), Some(DiskStatus::Failed));
    assert_eq!(vol.state().as_degraded().map(|n| n.get()), Some(1));
    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(1)));

    assert_eq!(t!(read(&vol, 0, 24).await), data);
}

/// Errors during the write phase leave the stripe readable
#[test_log::test(tokio::test)]
async fn write_error() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Pq).disks(5).build();
    let old = random_data(1, 12);
    t!(write(&vol, 0, &old).await);
    mds[3].kill();
    let new = random_data(2, 12);
    assert_eq!(write(&vol, 0, &new).await, Err(Error::EAGAIN));
    assert_eq!(vol.disk_status(3), Some(DiskStatus::Failed));
    t!(write(&vol, 0, &new).await);
    assert_eq!(t!(read(&vol, 0, 12).await), new);
}

/// Losing more disks than the layout tolerates fails the volume for good
#[test_log::test(tokio::test)]
async fn too_many_failures() {
    let (vol, mds) = VolumeBuilder::new(LayoutKind::Raid5).build();
    let mut events = vol.subscribe();
    t!(vol.mark_disk_failed(0));
    mds[0].kill();
    mds[3].kill();
    assert_eq!(read(&vol, 0, 24).await, Err(Error::ENXIO));
    assert_eq!(vol.state(), VolumeState::Failed);
    assert_eq!(write(&vol, 0, &[0u8; 512]).await, Err(Error::ENXIO));
    assert_eq!(read(&vol, 0, 1).await, Err(Error::ENXIO));
    assert_eq!(vol.reconstruct(0).await, Err(Error::ENXIO));

    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(0)));
    assert_eq!(events.next().await, Some(VolumeEvent::DiskFailed(3)));
    assert_eq!(events.next().await, Some(VolumeEvent::VolumeFailed));
}

/// A closed volume rejects everything
#[test_log::test(tokio::test)]
async fn close() {
    let (vol, _mds) = VolumeBuilder::new(LayoutKind::Raid5).spares(1).build();
    let mut events = vol.subscribe();
    t!(write(&vol, 0, &random_data(1, 4)).await);
    vol.close().await;
    assert_eq!(read(&vol, 0, 4).await, Err(Error::EPIPE));
    assert_eq!(write(&vol, 0, &random_data(1, 4)).await, Err(Error::EPIPE));
    assert_eq!(vol.reconstruct(1).await, Err(Error::EPIPE));
    // Subscribers are disconnected
    assert_eq!(events.next().await, None);
}
