use thiserror::Error;

use crate::Duration;

/// Parameters governing how raw delivery counters are folded into estimates
///
/// Shared by every strategy. The defaults match a 802.11a/g style rate set with 1200 byte data
/// frames and a statistics window of 100ms. [`CreditThresholdConfig`](crate::CreditThresholdConfig)
/// starts from a 10ms window instead.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub(crate) refresh_interval: Duration,
    pub(crate) ewma_weight: u32,
    pub(crate) reference_frame_size: u32,
}

impl StatsConfig {
    /// Interval between two statistics refreshes of the same peer
    ///
    /// Each refresh also runs the decision logic, so shorter intervals react faster at the cost
    /// of noisier estimates.
    pub fn refresh_interval(&mut self, value: Duration) -> &mut Self {
        self.refresh_interval = value;
        self
    }

    /// Weight, in percent, given to the previous EWMA success probability at each refresh
    ///
    /// Must be at most 100. Higher values smooth more.
    pub fn ewma_weight(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value > 100 {
            return Err(ConfigError::OutOfBounds);
        }
        self.ewma_weight = value;
        Ok(self)
    }

    /// Frame size in bytes used to precompute each rate's ideal transmission time
    pub fn reference_frame_size(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.reference_frame_size = value;
        Ok(self)
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_millis(100),
            ewma_weight: 75,
            reference_frame_size: 1200,
        }
    }
}

/// Errors in the configuration of a rate controller
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Value exceeds supported bounds
    #[error("value exceeds supported bounds")]
    OutOfBounds,
}
