use std::sync::Arc;

use super::{ControllerFactory, Decision, Engine, RateController, Strategy};
use crate::{config::ConfigError, Duration, Instant, RateIndex, StatsConfig};

/// Customary upper bound of the adaptive observation window
const ADAPTIVE_WINDOW_MAX: u32 = 30;
/// Default statistics refresh interval of credit controllers
const REFRESH_INTERVAL: Duration = Duration::from_millis(10);

/// Credit-based rate controller
///
/// Counts delivered and dropped frames over an observation window. Windows with few errors earn
/// credit and enough credit raises the rate by one step; windows with many errors, or with more
/// retries than deliveries, lower it.
pub type CreditThreshold = Engine<CreditStrategy>;

impl CreditThreshold {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<CreditThresholdConfig>, now: Instant) -> Self {
        Self::with_strategy(CreditStrategy::new(config), now)
    }
}

/// Decision logic of [`CreditThreshold`]
#[derive(Debug, Clone)]
pub struct CreditStrategy {
    config: Arc<CreditThresholdConfig>,
    /// Frames needed before a window is judged
    window: u32,
}

impl CreditStrategy {
    fn new(config: Arc<CreditThresholdConfig>) -> Self {
        Self {
            window: config.add_credit_threshold,
            config,
        }
    }

    /// Current size of the observation window, in frames
    pub fn window(&self) -> u32 {
        self.window
    }
}

impl Strategy for CreditStrategy {
    fn stats(&self) -> &StatsConfig {
        &self.config.stats
    }

    fn ranked_rates(&self) -> usize {
        5
    }

    fn raises_to_best(&self) -> bool {
        true
    }

    fn decides_on_feedback(&self) -> bool {
        true
    }

    fn initial_rate(&self, candidates: usize) -> RateIndex {
        self.config.initial_rate.index(candidates)
    }

    fn on_data_failed(&mut self) {
        if let Some(max) = self.config.adaptive_window {
            if self.window < max {
                self.window += 1;
            }
        }
    }

    fn on_data_succeeded(&mut self) {
        if self.config.adaptive_window.is_some() && self.window > self.config.add_credit_threshold
        {
            self.window -= 1;
        }
    }

    fn decide(&mut self, mut decision: Decision<'_>) {
        let candidates = decision.table.len();
        let state = &mut *decision.state;
        let (ok, err) = (state.ok_count, state.err_count);
        let enough = ok + err >= self.window;
        // more than 30% of the deliveries were lost
        let lossy = 10 * err > 3 * ok;
        let mut rate = state.current_rate;

        if enough && err > 0 && ok == 0 {
            rate = rate.saturating_sub(1);
            state.credit = 0;
        }

        if enough && ok < state.retry_count {
            rate = rate.saturating_sub(1);
            state.credit = 0;
        }

        if enough && lossy {
            rate = rate.saturating_sub(1);
            if ok < err && rate >= 4 {
                rate = rate * 3 / 4;
            }
            state.credit = 0;
        } else if enough {
            state.credit += 1;
        }

        if state.credit >= self.config.raise_threshold {
            state.credit = 0;
            if rate + 1 < candidates {
                rate += 1;
            }
        }

        if rate != state.current_rate {
            decision.commit(rate);
        } else if enough {
            state.reset_window();
        }
    }
}

/// Rate to start from once a peer's rates are known
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub enum InitialRate {
    /// The most robust rate
    #[default]
    Slowest,
    /// The rate halfway through the candidate list
    Middle,
    /// The fastest rate, relying on fallbacks to find a working one
    Fastest,
}

impl InitialRate {
    fn index(self, candidates: usize) -> RateIndex {
        match self {
            Self::Slowest => 0,
            Self::Middle => candidates / 2,
            Self::Fastest => candidates.saturating_sub(1),
        }
    }
}

/// Configuration for the [`CreditThreshold`] rate controller
#[derive(Debug, Clone)]
pub struct CreditThresholdConfig {
    stats: StatsConfig,
    add_credit_threshold: u32,
    raise_threshold: u32,
    adaptive_window: Option<u32>,
    initial_rate: InitialRate,
}

impl CreditThresholdConfig {
    /// Statistics parameters
    ///
    /// Defaults to [`StatsConfig::default`] with a refresh interval of 10ms.
    pub fn stats(&mut self, value: StatsConfig) -> &mut Self {
        self.stats = value;
        self
    }

    /// Number of frames observed before a window earns credit or lowers the rate
    ///
    /// Also the lower bound of the adaptive window, when enabled.
    pub fn add_credit_threshold(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 || self.adaptive_window.is_some_and(|max| max < value) {
            return Err(ConfigError::OutOfBounds);
        }
        self.add_credit_threshold = value;
        Ok(self)
    }

    /// Credit needed to raise the rate by one step
    pub fn raise_threshold(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value == 0 {
            return Err(ConfigError::OutOfBounds);
        }
        self.raise_threshold = value;
        Ok(self)
    }

    /// Widen the observation window by one frame on each failure and narrow it by one on each
    /// success, up to `max` frames
    ///
    /// Recommended value: `Some(30)`. `None` keeps the window fixed.
    pub fn adaptive_window(&mut self, max: Option<u32>) -> Result<&mut Self, ConfigError> {
        if max.is_some_and(|max| max < self.add_credit_threshold) {
            return Err(ConfigError::OutOfBounds);
        }
        self.adaptive_window = max;
        Ok(self)
    }

    /// Enable the adaptive window with its customary upper bound
    pub fn with_adaptive_window(&mut self) -> Result<&mut Self, ConfigError> {
        self.adaptive_window(Some(ADAPTIVE_WINDOW_MAX))
    }

    /// Rate to start from once a peer's rates are known
    pub fn initial_rate(&mut self, value: InitialRate) -> &mut Self {
        self.initial_rate = value;
        self
    }
}

impl Default for CreditThresholdConfig {
    fn default() -> Self {
        let mut stats = StatsConfig::default();
        stats.refresh_interval(REFRESH_INTERVAL);
        Self {
            stats,
            add_credit_threshold: 10,
            raise_threshold: 10,
            adaptive_window: None,
            initial_rate: InitialRate::Slowest,
        }
    }
}

impl ControllerFactory for CreditThresholdConfig {
    fn build(self: Arc<Self>, now: Instant) -> Box<dyn RateController> {
        Box::new(CreditThreshold::new(self, now))
    }
}
