//! Adaptive bitrate configuration

use crate::error::{AbrError, AbrResult};
use crate::ladder::DEFAULT_PROFILE;
use crate::quality::SampleThresholds;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Entries kept per broadcast in the adjustment history
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbrConfig {
    /// How often the network probe is sampled
    pub sample_interval: Duration,
    /// Consecutive bad samples before stepping down
    pub downgrade_after: u32,
    /// Consecutive good samples before stepping up
    pub upgrade_after: u32,
    /// Profile used when `start` is not given one
    pub initial_profile: String,
    pub thresholds: SampleThresholds,
    pub history_capacity: usize,
}

impl AbrConfig {
    pub fn validate(&self) -> AbrResult<()> {
        if self.downgrade_after == 0 || self.upgrade_after == 0 {
            return Err(AbrError::InvalidConfig(
                "hysteresis thresholds must be at least 1".to_string(),
            ));
        }
        if self.sample_interval.is_zero() {
            return Err(AbrError::InvalidConfig("sample interval must be non-zero".to_string()));
        }
        if self.history_capacity == 0 {
            return Err(AbrError::InvalidConfig("history capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(10),
            downgrade_after: 3,
            upgrade_after: 5,
            initial_profile: DEFAULT_PROFILE.to_string(),
            thresholds: SampleThresholds::default(),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}
