use std::sync::Arc;

use tracing::debug;

use super::{ControllerFactory, Decision, Engine, RateController, Strategy};
use crate::{
    config::ConfigError,
    event::{Cause, Event},
    peer::PeerState,
    Duration, Instant, RateIndex, StatsConfig,
};

/// Throughput ratio under which the rate is cut hard instead of stepped down
const HEAVY_LOSS_RATIO: f64 = 0.75;

/// Throughput-probing rate controller
///
/// Compares the throughput of the current rate with a long-run average of the throughput
/// achieved so far. While it keeps up, faster rates are probed one refresh at a time, doubling
/// the step after repeated successful probes; a probe that falls behind is reverted and counts
/// as an oscillation, which suspends probing until the re-probe interval expires.
pub type Probing = Engine<ProbeStrategy>;

impl Probing {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<ProbingConfig>, now: Instant) -> Self {
        Self::with_strategy(ProbeStrategy::new(config), now)
    }
}

/// Decision logic of [`Probing`]
#[derive(Debug, Clone)]
pub struct ProbeStrategy {
    config: Arc<ProbingConfig>,
    pub(crate) probe: ProbeState,
}

impl ProbeStrategy {
    fn new(config: Arc<ProbingConfig>) -> Self {
        Self {
            probe: ProbeState::new(config.interval),
            config,
        }
    }

    /// Oscillation control state
    pub fn probe(&self) -> &ProbeState {
        &self.probe
    }

    /// Judge the rate probed at the previous refresh
    fn evaluate_probe(&mut self, decision: &mut Decision<'_>) {
        let probe = &mut self.probe;
        probe.probing = false;
        let rate = decision.state.current_rate;
        let throughput = decision.table[rate].throughput();

        if throughput < probe.historical_throughput && probe.last_rate != rate {
            probe.consecutive_gains = 0;
            probe.oscillation_count += 1;
            probe.interval = if probe.multiplicative {
                self.config.revert_interval_multiplicative
            } else {
                self.config.revert_interval_additive
            };
            decision.state.next_interval_deadline = decision.now + probe.interval;
            debug!(
                rate,
                throughput,
                historical = probe.historical_throughput,
                oscillations = probe.oscillation_count,
                "probe fell behind"
            );
            decision.change(probe.last_rate, Cause::ProbeReverted, false);
        } else if throughput > probe.last_throughput && probe.last_rate != rate {
            probe.consecutive_gains += 1;
            probe.interval = self.config.gain_interval;
            decision.state.next_interval_deadline = decision.now + probe.interval;
            debug!(
                rate,
                throughput,
                previous = probe.last_throughput,
                gains = probe.consecutive_gains,
                "probe confirmed"
            );
            decision.emit(Event::ProbeConfirmed { rate });
        }
    }
}

impl Strategy for ProbeStrategy {
    fn stats(&self) -> &StatsConfig {
        &self.config.stats
    }

    fn ranked_rates(&self) -> usize {
        2
    }

    fn adapt_period(&self) -> Duration {
        self.probe.interval
    }

    fn on_select(&mut self, now: Instant, state: &mut PeerState) {
        if now < state.next_interval_deadline {
            return;
        }
        state.next_interval_deadline = now + self.probe.interval;
        self.probe.oscillation_count = 0;
    }

    fn decide(&mut self, mut decision: Decision<'_>) {
        let candidates = decision.table.len();
        let current = decision.state.current_rate;
        let throughput = decision.table[current].throughput();
        self.probe.multiplicative = self.probe.consecutive_gains > 1;

        if self.probe.probing {
            self.evaluate_probe(&mut decision);
            return;
        }

        let probe = &mut self.probe;
        if decision.state.ok_count + decision.state.err_count > 0 {
            let weight = u64::from(self.config.ewma_history_weight);
            probe.historical_throughput =
                (probe.historical_throughput * (100 - weight) + throughput * weight) / 100;
        }
        if probe.historical_throughput == 0 {
            return;
        }
        let delta = throughput as f64 / probe.historical_throughput as f64;

        let mut rate = current;
        if delta >= 1.0 {
            probe.successive_losses = 0;
            if probe.oscillation_count == 0 && rate + 1 < candidates {
                rate = if probe.multiplicative {
                    (rate * 2).max(rate + 1).min(candidates - 1)
                } else {
                    rate + 1
                };
                probe.probing = true;
                decision.emit(Event::ProbeStarted {
                    from: current,
                    to: rate,
                });
            }
        } else if delta >= HEAVY_LOSS_RATIO {
            rate = rate.saturating_sub(1);
            probe.consecutive_gains = 0;
            probe.oscillation_count = 0;
        } else {
            probe.successive_losses += 1;
            rate = if probe.successive_losses == 1 {
                rate * 3 / 4
            } else {
                rate.saturating_sub(1)
            };
            probe.consecutive_gains = 0;
            probe.oscillation_count = 0;
        }
        debug!(
            from = current,
            to = rate,
            throughput,
            historical = probe.historical_throughput,
            delta,
            "checked rate"
        );

        probe.last_throughput = throughput;
        probe.last_rate = current;
        decision.commit(rate);
    }
}

/// Oscillation control state of one peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeState {
    pub(crate) probing: bool,
    pub(crate) consecutive_gains: u32,
    pub(crate) successive_losses: u32,
    pub(crate) last_rate: RateIndex,
    pub(crate) last_throughput: u64,
    pub(crate) historical_throughput: u64,
    pub(crate) oscillation_count: u32,
    pub(crate) multiplicative: bool,
    /// Current re-probe interval
    pub(crate) interval: Duration,
}

impl ProbeState {
    fn new(interval: Duration) -> Self {
        Self {
            probing: false,
            consecutive_gains: 0,
            successive_losses: 0,
            last_rate: 0,
            last_throughput: 0,
            historical_throughput: 0,
            oscillation_count: 0,
            multiplicative: false,
            interval,
        }
    }

    /// Whether the current rate is a probe awaiting judgement
    pub fn is_probing(&self) -> bool {
        self.probing
    }

    /// Probes confirmed in a row
    pub fn consecutive_gains(&self) -> u32 {
        self.consecutive_gains
    }

    /// Refreshes in a row whose throughput fell well behind the long-run average
    pub fn successive_losses(&self) -> u32 {
        self.successive_losses
    }

    /// Rate in use before the last decision
    pub fn last_rate(&self) -> RateIndex {
        self.last_rate
    }

    /// Throughput of [`ProbeState::last_rate`] at the last decision
    pub fn last_throughput(&self) -> u64 {
        self.last_throughput
    }

    /// Long-run average of the throughput of the rates in use
    pub fn historical_throughput(&self) -> u64 {
        self.historical_throughput
    }

    /// Reverted probes since the re-probe interval last expired
    pub fn oscillation_count(&self) -> u32 {
        self.oscillation_count
    }

    /// Whether probes double the rate instead of stepping it by one
    pub fn is_multiplicative(&self) -> bool {
        self.multiplicative
    }

    /// Current re-probe interval
    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Configuration for the [`Probing`] rate controller
#[derive(Debug, Clone)]
pub struct ProbingConfig {
    stats: StatsConfig,
    ewma_history_weight: u32,
    interval: Duration,
    revert_interval_additive: Duration,
    revert_interval_multiplicative: Duration,
    gain_interval: Duration,
}

impl ProbingConfig {
    /// Statistics parameters
    pub fn stats(&mut self, value: StatsConfig) -> &mut Self {
        self.stats = value;
        self
    }

    /// Weight, in percent, given to the newest throughput in the long-run average
    pub fn ewma_history_weight(&mut self, value: u32) -> Result<&mut Self, ConfigError> {
        if value > 100 {
            return Err(ConfigError::OutOfBounds);
        }
        self.ewma_history_weight = value;
        Ok(self)
    }

    /// Initial re-probe interval, after which oscillations are forgotten
    pub fn interval(&mut self, value: Duration) -> &mut Self {
        self.interval = value;
        self
    }

    /// Re-probe interval after reverting a probe reached by a single step
    pub fn revert_interval_additive(&mut self, value: Duration) -> &mut Self {
        self.revert_interval_additive = value;
        self
    }

    /// Re-probe interval after reverting a probe reached by doubling the rate
    pub fn revert_interval_multiplicative(&mut self, value: Duration) -> &mut Self {
        self.revert_interval_multiplicative = value;
        self
    }

    /// Re-probe interval after a probe is confirmed
    pub fn gain_interval(&mut self, value: Duration) -> &mut Self {
        self.gain_interval = value;
        self
    }
}

impl Default for ProbingConfig {
    fn default() -> Self {
        Self {
            stats: StatsConfig::default(),
            ewma_history_weight: 75,
            interval: Duration::from_millis(100),
            revert_interval_additive: Duration::from_millis(900),
            revert_interval_multiplicative: Duration::from_millis(100),
            gain_interval: Duration::from_millis(100),
        }
    }
}

impl ControllerFactory for ProbingConfig {
    fn build(self: Arc<Self>, now: Instant) -> Box<dyn RateController> {
        Box::new(Probing::new(self, now))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::table::{tests::FixedModes, RateTable};

    struct Harness {
        strategy: ProbeStrategy,
        state: PeerState,
        table: RateTable,
        events: VecDeque<Event>,
        now: Instant,
    }

    impl Harness {
        fn new(rate: RateIndex, candidates: usize) -> Self {
            let now = Instant::now();
            let mut state = PeerState::new(now, now + Duration::from_millis(100));
            state.initialized = true;
            state.candidate_count = candidates;
            state.switch(rate);
            let modes = FixedModes(vec![1000; candidates]);
            Self {
                strategy: ProbeStrategy::new(Arc::new(ProbingConfig::default())),
                state,
                table: RateTable::new(&modes, candidates, 1200).unwrap(),
                events: VecDeque::new(),
                now,
            }
        }

        fn set_throughput(&mut self, rate: RateIndex, throughput: u64) {
            self.table.stats_mut(rate).throughput = throughput;
        }

        /// Run one decision with a non-empty observation window
        fn decide(&mut self) {
            self.state.ok_count = 5;
            self.strategy.decide(Decision {
                now: self.now,
                state: &mut self.state,
                table: &self.table,
                events: &mut self.events,
            });
        }

        fn probe(&self) -> &ProbeState {
            &self.strategy.probe
        }
    }

    #[test]
    fn probes_and_reverts_oscillating_rate() {
        let mut h = Harness::new(2, 5);
        h.strategy.probe.historical_throughput = 1000;
        h.set_throughput(2, 1200);
        h.decide();

        // (1000 * 25 + 1200 * 75) / 100
        assert_eq!(h.probe().historical_throughput(), 1150);
        assert_eq!(h.state.current_rate(), 3);
        assert!(h.probe().is_probing());
        assert_eq!(h.probe().last_rate(), 2);
        assert_eq!(h.probe().last_throughput(), 1200);
        assert_eq!(h.state.ok_count(), 0);
        assert!(h.events.contains(&Event::ProbeStarted { from: 2, to: 3 }));

        h.set_throughput(3, 900);
        h.decide();
        assert_eq!(h.state.current_rate(), 2);
        assert!(!h.probe().is_probing());
        assert_eq!(h.probe().oscillation_count(), 1);
        assert_eq!(h.probe().consecutive_gains(), 0);
        assert_eq!(h.probe().interval(), Duration::from_millis(900));
        assert_eq!(
            h.state.next_interval_deadline(),
            h.now + Duration::from_millis(900)
        );
        assert_eq!(
            h.events.back(),
            Some(&Event::RateChanged {
                from: 3,
                to: 2,
                cause: Cause::ProbeReverted
            })
        );
        // the revert keeps the observation window
        assert_eq!(h.state.ok_count(), 5);

        // oscillating peers do not probe again
        h.decide();
        assert_eq!(h.state.current_rate(), 2);
        assert!(!h.probe().is_probing());
    }

    #[test]
    fn confirmed_probe_gains_confidence() {
        let mut h = Harness::new(1, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.set_throughput(1, 1000);
        h.decide();
        assert_eq!(h.state.current_rate(), 2);

        h.set_throughput(2, 1500);
        h.decide();
        assert_eq!(h.state.current_rate(), 2);
        assert_eq!(h.probe().consecutive_gains(), 1);
        assert_eq!(h.probe().interval(), Duration::from_millis(100));
        assert_eq!(h.events.back(), Some(&Event::ProbeConfirmed { rate: 2 }));
    }

    #[test]
    fn repeated_gains_double_the_step() {
        let mut h = Harness::new(2, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.strategy.probe.consecutive_gains = 2;
        h.set_throughput(2, 1000);
        h.decide();
        assert!(h.probe().is_multiplicative());
        assert_eq!(h.state.current_rate(), 4);

        let mut h = Harness::new(5, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.strategy.probe.consecutive_gains = 2;
        h.set_throughput(5, 1000);
        h.decide();
        assert_eq!(h.state.current_rate(), 7);

        // doubling the slowest rate still moves up
        let mut h = Harness::new(0, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.strategy.probe.consecutive_gains = 2;
        h.set_throughput(0, 1000);
        h.decide();
        assert_eq!(h.state.current_rate(), 1);
    }

    #[test]
    fn mild_loss_steps_down() {
        let mut h = Harness::new(4, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.strategy.probe.consecutive_gains = 3;
        h.strategy.probe.oscillation_count = 2;
        // history becomes (1000 * 25 + 800 * 75) / 100 = 850, delta ~0.94
        h.set_throughput(4, 800);
        h.decide();
        assert_eq!(h.state.current_rate(), 3);
        assert_eq!(h.probe().consecutive_gains(), 0);
        assert_eq!(h.probe().oscillation_count(), 0);
        assert_eq!(h.probe().last_rate(), 4);
    }

    #[test]
    fn heavy_loss_cuts_then_steps() {
        let mut h = Harness::new(7, 8);
        h.strategy.probe.historical_throughput = 4000;
        h.set_throughput(7, 0);
        h.decide();
        assert_eq!(h.probe().successive_losses(), 1);
        assert_eq!(h.state.current_rate(), 5);

        h.set_throughput(5, 0);
        h.decide();
        assert_eq!(h.probe().successive_losses(), 2);
        assert_eq!(h.state.current_rate(), 4);
    }

    #[test]
    fn empty_history_skips_decision() {
        let mut h = Harness::new(3, 8);
        h.set_throughput(3, 0);
        h.decide();
        assert_eq!(h.state.current_rate(), 3);
        assert_eq!(h.probe().last_rate(), 0);
        assert!(h.events.is_empty());
    }

    #[test]
    fn quiet_window_keeps_history() {
        let mut h = Harness::new(3, 8);
        h.strategy.probe.historical_throughput = 1000;
        h.set_throughput(3, 2000);
        h.state.ok_count = 0;
        h.strategy.decide(Decision {
            now: h.now,
            state: &mut h.state,
            table: &h.table,
            events: &mut h.events,
        });
        assert_eq!(h.probe().historical_throughput(), 1000);
        assert_eq!(h.state.current_rate(), 4);
    }

    #[test]
    fn interval_expiry_forgets_oscillations() {
        let mut h = Harness::new(2, 5);
        h.strategy.probe.oscillation_count = 3;

        let early = h.now + Duration::from_millis(50);
        h.strategy.on_select(early, &mut h.state);
        assert_eq!(h.probe().oscillation_count(), 3);

        let late = h.now + Duration::from_millis(100);
        h.strategy.on_select(late, &mut h.state);
        assert_eq!(h.probe().oscillation_count(), 0);
        assert_eq!(
            h.state.next_interval_deadline(),
            late + Duration::from_millis(100)
        );
    }
}
