//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pools never run with fewer workers than this, whatever is configured.
pub const MIN_POOL_SIZE: usize = 2;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers the pool keeps alive (floored at [`MIN_POOL_SIZE`])
    pub desired_workers: usize,
    /// Terminate the process when the pool empties and cannot be refilled
    pub exit_on_exhaustion: bool,
    /// Delay before that termination so pending log lines get flushed
    pub fatal_grace: Duration,
}

impl PoolConfig {
    #[must_use]
    pub fn effective_size(&self) -> usize {
        self.desired_workers.max(MIN_POOL_SIZE)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired_workers: MIN_POOL_SIZE,
            exit_on_exhaustion: true,
            fatal_grace: Duration::from_secs(3),
        }
    }
}
