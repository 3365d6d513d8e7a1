// vim: tw=80
use std::sync::Arc;

use divbuf::DivBufShared;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use rframe_core::{
    *,
    config::{LayoutKind, VolumeConfig},
    disk::{Disk, MemDisk},
    volume::RaidVolume,
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

/// Size of each simulated disk, in sectors
const DISK_SECTORS: SectorT = 256;

/// Helper to create a fresh volume out of `MemDisk`s
#[derive(Debug)]
struct VolumeBuilder {
    kind: LayoutKind,
    /// Number of member disks
    n: usize,
    /// Number of dedicated spares
    spares: usize,
    /// Stripe unit size in sectors
    spu: SectorT,
    floating_buffers: Option<u32>,
    head_sep_limit: Option<u32>,
    /// Optimum queue depth of every disk
    queue_depth: u32,
}

impl VolumeBuilder {
    /// Returns the volume along with handles to every disk, members first
    fn build(&self) -> (RaidVolume, Vec<MemDisk>) {
        let mds = (0..self.n + self.spares)
            .map(|_| MemDisk::with_queue_depth(DISK_SECTORS,
                                               self.queue_depth))
            .collect::<Vec<_>>();
        let disks = mds[..self.n].iter()
            .map(|md| Arc::new(md.clone()) as Arc<dyn Disk>)
            .collect();
        let spares = mds[self.n..].iter()
            .map(|md| Arc::new(md.clone()) as Arc<dyn Disk>)
            .collect();
        let mut config = VolumeConfig::new(self.kind, self.spu);
        config.recon.floating_buffers = self.floating_buffers;
        config.recon.head_sep_limit = self.head_sep_limit;
        let vol = t!(RaidVolume::create(config, disks, spares));
        (vol, mds)
    }

    fn disks(&mut self, n: usize) -> &mut Self {
        self.n = n;
        self
    }

    fn floating_buffers(&mut self, n: u32) -> &mut Self {
        self.floating_buffers = Some(n);
        self
    }

    fn head_sep_limit(&mut self, n: u32) -> &mut Self {
        self.head_sep_limit = Some(n);
        self
    }

    fn new(kind: LayoutKind) -> Self {
        Self {
            kind,
            n: 4,
            spares: 0,
            spu: 4,
            floating_buffers: None,
            head_sep_limit: None,
            queue_depth: 8,
        }
    }

    fn queue_depth(&mut self, depth: u32) -> &mut Self {
        self.queue_depth = depth;
        self
    }

    fn spares(&mut self, spares: usize) -> &mut Self {
        self.spares = spares;
        self
    }

    fn stripe_unit(&mut self, spu: SectorT) -> &mut Self {
        self.spu = spu;
        self
    }
}

/// Deterministic pseudorandom contents for `nsectors` sectors
fn random_data(seed: u8, nsectors: SectorT) -> Vec<u8> {
    let mut rng = XorShiftRng::from_seed([seed; 16]);
    let mut v = vec![0u8; sectors2bytes(nsectors)];
    rng.fill(&mut v[..]);
    v
}

async fn read(vol: &RaidVolume, sector: SectorT, nsectors: SectorT)
    -> Result<Vec<u8>>
{
    let dbs = DivBufShared::from(vec![0u8; sectors2bytes(nsectors)]);
    vol.raid_read(dbs.try_mut().unwrap(), sector).await?;
    let v = dbs.try_const().unwrap()[..].to_vec();
    Ok(v)
}

async fn write(vol: &RaidVolume, sector: SectorT, data: &[u8]) -> Result<()> {
    let dbs = DivBufShared::from(data.to_vec());
    vol.raid_write(dbs.try_const().unwrap(), sector).await
}

mod fault;
mod io;
mod recon;
