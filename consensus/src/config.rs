use log::info;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write as _};

/// Capacity of the pacemaker inbound message queue.
pub const PACEMAKER_CHANNEL_CAPACITY: usize = 128;

/// Capacity of the stop, beat and round-timeout control queues.
pub const CONTROL_CHANNEL_CAPACITY: usize = 2;

pub trait Export: Serialize + DeserializeOwned {
    fn read(path: &str) -> Result<Self, std::io::Error> {
        let data = fs::read(path)?;
        serde_json::from_slice(data.as_slice())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    fn write(&self, path: &str) -> Result<(), std::io::Error> {
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        let mut writer = BufWriter::new(file);
        let data = serde_json::to_string_pretty(self).unwrap();
        writer.write_all(data.as_ref())?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Delay between a QC forming and the next scheduled beat, in ms.
    pub round_interval: u64,
    /// Base round timeout, in ms. Doubles on each consecutive timeout.
    pub round_timeout_interval: u64,
    /// Minimum number of M-blocks before a K-block may end the epoch.
    pub min_mblocks_per_epoch: u64,
    /// Verify the committee-establishment evidence embedded at epoch start.
    pub validate_evidence: bool,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            round_interval: 2_000,
            round_timeout_interval: 30_000,
            min_mblocks_per_epoch: 6,
            validate_evidence: false,
        }
    }
}

impl Export for Parameters {}

impl Parameters {
    pub fn log(&self) {
        // NOTE: These log entries are used to compute performance.
        info!("Round interval set to {} ms", self.round_interval);
        info!(
            "Round timeout interval set to {} ms",
            self.round_timeout_interval
        );
        info!(
            "Minimum mblocks per epoch set to {}",
            self.min_mblocks_per_epoch
        );
    }
}

/// Deployment preset. Committee sizing is configuration, not a constant.
#[derive(Clone, Serialize, Deserialize)]
pub struct PresetConfig {
    pub committee_min_size: usize,
    pub committee_max_size: usize,
    pub delegate_max_size: usize,
}

impl Default for PresetConfig {
    fn default() -> Self {
        Self {
            committee_min_size: 11,
            committee_max_size: 50,
            delegate_max_size: 100,
        }
    }
}

impl Export for PresetConfig {}
