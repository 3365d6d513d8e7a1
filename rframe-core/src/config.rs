// vim: tw=80
//! Volume configuration, as supplied by the configuration loader

use serde_derive::{Deserialize, Serialize};

use crate::types::*;

/// Which redundancy layout a volume uses
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutKind {
    /// RAID-0
    Nonredundant,
    /// RAID-1, as mirrored pairs
    Mirror,
    /// Dedicated parity disk
    Raid4,
    /// Left-symmetric rotating parity
    Raid5,
    /// RAID-5 with a rotating distributed spare
    Raid5RotatedSpare,
    /// RAID-6: P and Q parity
    Pq,
    /// Parity-declustered P+Q over a prime number of disks
    DeclusteredPq {
        disks_per_stripe: i16,
        #[serde(default)]
        distributed_spare: bool,
    },
}

/// How a mirror services reads while both halves are healthy
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorReadPolicy {
    /// Read from whichever copy has the least outstanding work
    #[default]
    Idle,
    /// Split each read in two, reading half from each copy
    Partition,
}

/// Tuning for the Reconstruction Controller.  Unset values are derived from
/// the stripe width.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct ReconConfig {
    /// Cap on floating reconstruction buffers.  Defaults to 4× stripe width.
    pub floating_buffers: Option<u32>,
    /// Maximum number of RUs the rebuild cursor may lead the slowest
    /// surviving disk by.  Defaults to 2× stripe width.
    pub head_sep_limit: Option<u32>,
}

impl ReconConfig {
    pub fn floating_buffers(&self, stripe_width: u32) -> u32 {
        self.floating_buffers.unwrap_or(4 * stripe_width)
    }

    pub fn head_sep_limit(&self, stripe_width: u32) -> u32 {
        self.head_sep_limit.unwrap_or(2 * stripe_width)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How many times to retry an operation that fails transiently
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig{max_retries: 3}
    }
}

/// Everything needed to assemble a `RaidVolume` from a set of disks
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeConfig {
    pub layout: LayoutKind,
    /// Stripe unit size, in sectors
    pub sectors_per_stripe_unit: SectorT,
    #[serde(default)]
    pub mirror_read: MirrorReadPolicy,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub recon: ReconConfig,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
}

impl VolumeConfig {
    /// A configuration with every optional setting at its default
    pub fn new(layout: LayoutKind, sectors_per_stripe_unit: SectorT) -> Self {
        VolumeConfig {
            layout,
            sectors_per_stripe_unit,
            mirror_read: MirrorReadPolicy::default(),
            queue: QueueConfig::default(),
            recon: ReconConfig::default(),
            uuid: Uuid::new_v4(),
        }
    }

    /// Parse a configuration from YAML.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(s)
            .map_err(|e| {
                tracing::warn!("Invalid volume configuration: {}", e);
                Error::EINVAL
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that don't depend on the disks
    pub fn validate(&self) -> Result<()> {
        if self.sectors_per_stripe_unit == 0 ||
            self.recon.floating_buffers == Some(0) ||
            self.recon.head_sep_limit == Some(0)
        {
            return Err(Error::EINVAL);
        }
        Ok(())
    }
}

// LCOV_EXCL_STOP
