use std::ops::Index;

use thiserror::Error;

use crate::{phy::PeerModes, Duration, RateIndex};

/// Fixed-point value representing a success probability of 100%
pub const PROBABILITY_SCALE: u32 = 18_000;

/// EWMA probability above which a rate is considered reliable enough to retry less
const RELIABLE_PROBABILITY: u32 = PROBABILITY_SCALE * 95 / 100;
/// EWMA probability below which retries at a rate are considered wasted
const HOPELESS_PROBABILITY: u32 = PROBABILITY_SCALE / 10;
/// Ceiling of the adjusted retry budget of reliable or hopeless rates
const MAX_ADJUSTED_RETRIES: u32 = 2;

/// Delivery statistics of one candidate rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateStats {
    pub(crate) attempts: u64,
    pub(crate) successes: u64,
    pub(crate) last_attempts: u64,
    pub(crate) last_successes: u64,
    pub(crate) lifetime_attempts: u64,
    pub(crate) lifetime_successes: u64,
    pub(crate) probability: u32,
    pub(crate) ewma_probability: u32,
    pub(crate) throughput: u64,
    pub(crate) perfect_duration: Duration,
    pub(crate) retry_budget: u32,
    pub(crate) adjusted_retry_budget: u32,
}

impl RateStats {
    fn new(perfect_duration: Duration) -> Self {
        Self {
            attempts: 0,
            successes: 0,
            last_attempts: 0,
            last_successes: 0,
            lifetime_attempts: 0,
            lifetime_successes: 0,
            probability: 0,
            ewma_probability: 0,
            throughput: 0,
            perfect_duration,
            retry_budget: 1,
            adjusted_retry_budget: 1,
        }
    }

    /// Transmission attempts, retries included, since the last refresh
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// Acknowledged frames since the last refresh
    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// Attempts observed during the previous statistics window
    pub fn last_attempts(&self) -> u64 {
        self.last_attempts
    }

    /// Successes observed during the previous statistics window
    pub fn last_successes(&self) -> u64 {
        self.last_successes
    }

    /// Attempts accumulated over the lifetime of the peer
    pub fn lifetime_attempts(&self) -> u64 {
        self.lifetime_attempts
    }

    /// Successes accumulated over the lifetime of the peer
    pub fn lifetime_successes(&self) -> u64 {
        self.lifetime_successes
    }

    /// Success probability of the last window that saw any attempt, out of
    /// [`PROBABILITY_SCALE`]
    pub fn probability(&self) -> u32 {
        self.probability
    }

    /// Smoothed success probability, out of [`PROBABILITY_SCALE`]
    pub fn ewma_probability(&self) -> u32 {
        self.ewma_probability
    }

    /// Expected delivery rate, in probability units per second of airtime
    pub fn throughput(&self) -> u64 {
        self.throughput
    }

    /// Transmission time of a reference frame at this rate
    pub fn perfect_duration(&self) -> Duration {
        self.perfect_duration
    }

    /// Nominal number of retries permitted at this rate
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    /// Retries permitted at this rate after accounting for its reliability
    pub fn adjusted_retry_budget(&self) -> u32 {
        self.adjusted_retry_budget
    }

    /// Fold the counters of the window that just ended into the estimates
    fn fold(&mut self, ewma_weight: u32) {
        if self.attempts > 0 {
            // successes never exceed attempts, so this fits the fixed-point range
            let probability =
                (self.successes * u64::from(PROBABILITY_SCALE) / self.attempts) as u32;
            self.lifetime_successes += self.successes;
            self.lifetime_attempts += self.attempts;
            self.probability = probability;

            let weight = u64::from(ewma_weight);
            self.ewma_probability = ((u64::from(probability) * (100 - weight)
                + u64::from(self.ewma_probability) * weight)
                / 100) as u32;
            self.throughput = throughput(self.ewma_probability, self.perfect_duration);
        }

        self.last_attempts = self.attempts;
        self.last_successes = self.successes;
        self.attempts = 0;
        self.successes = 0;

        self.adjusted_retry_budget = if self.ewma_probability > RELIABLE_PROBABILITY
            || self.ewma_probability < HOPELESS_PROBABILITY
        {
            (self.retry_budget >> 1).min(MAX_ADJUSTED_RETRIES)
        } else {
            self.retry_budget
        };
        if self.adjusted_retry_budget == 0 {
            self.adjusted_retry_budget = 1;
        }
    }
}

/// Expected delivery rate of a link with success probability `ewma_probability` whose frames
/// take `perfect_duration` of airtime
pub(crate) fn throughput(ewma_probability: u32, perfect_duration: Duration) -> u64 {
    let micros = perfect_duration.as_micros() as u64;
    u64::from(ewma_probability) * (1_000_000 / micros)
}

/// Per-rate statistics of one peer, indexed slowest rate first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateTable {
    rates: Vec<RateStats>,
}

impl RateTable {
    /// Build a table for the first `count` rates of `modes`
    pub(crate) fn new(
        modes: &dyn PeerModes,
        count: usize,
        frame_size: u32,
    ) -> Result<Self, InitError> {
        if count == 0 {
            return Err(InitError::NoRates);
        }
        let mut table = Self {
            rates: Vec::with_capacity(count),
        };
        table.extend(modes, count, frame_size)?;
        Ok(table)
    }

    /// Append entries until the table covers `count` rates
    ///
    /// Existing entries keep their statistics. Does nothing if the table is already that large.
    pub(crate) fn extend(
        &mut self,
        modes: &dyn PeerModes,
        count: usize,
        frame_size: u32,
    ) -> Result<(), InitError> {
        let start = self.rates.len();
        let mut added = Vec::with_capacity(count.saturating_sub(start));
        for rate in start..count {
            let duration = modes.mode_duration(rate, frame_size);
            if duration < Duration::from_micros(1) {
                return Err(InitError::ZeroDuration { rate });
            }
            added.push(RateStats::new(duration));
        }
        self.rates.extend(added);
        Ok(())
    }

    /// Number of candidate rates
    pub fn len(&self) -> usize {
        self.rates.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Statistics of `rate`, if it exists
    pub fn get(&self, rate: RateIndex) -> Option<&RateStats> {
        self.rates.get(rate)
    }

    /// Iterate over the entries, slowest rate first
    pub fn iter(&self) -> impl Iterator<Item = &RateStats> {
        self.rates.iter()
    }

    pub(crate) fn record_success(&mut self, rate: RateIndex) {
        let stats = &mut self.rates[rate];
        stats.successes += 1;
        stats.attempts += 1;
    }

    pub(crate) fn record_attempts(&mut self, rate: RateIndex, attempts: u32) {
        self.rates[rate].attempts += u64::from(attempts);
    }

    /// Close the current statistics window of every rate
    pub(crate) fn fold(&mut self, ewma_weight: u32) {
        for stats in &mut self.rates {
            stats.fold(ewma_weight);
        }
    }

    /// Indices of the `N` highest throughputs, best first
    ///
    /// Each place is found by a scan that skips the indices already placed. On ties the lowest
    /// index wins, and a place nothing beats stays at index 0.
    pub(crate) fn best_throughput<const N: usize>(&self) -> [RateIndex; N] {
        let mut best = [0; N];
        for place in 0..N {
            let mut max = 0;
            for (rate, stats) in self.rates.iter().enumerate() {
                if best[..place].contains(&rate) {
                    continue;
                }
                if max < stats.throughput {
                    best[place] = rate;
                    max = stats.throughput;
                }
            }
        }
        best
    }

    /// Index of the highest EWMA success probability
    pub(crate) fn best_probability(&self) -> RateIndex {
        let mut best = 0;
        let mut max = 0;
        for (rate, stats) in self.rates.iter().enumerate() {
            if max < stats.ewma_probability {
                best = rate;
                max = stats.ewma_probability;
            }
        }
        best
    }

    #[cfg(test)]
    pub(crate) fn stats_mut(&mut self, rate: RateIndex) -> &mut RateStats {
        &mut self.rates[rate]
    }
}

impl Index<RateIndex> for RateTable {
    type Output = RateStats;
    fn index(&self, rate: RateIndex) -> &RateStats {
        &self.rates[rate]
    }
}

/// Reasons a rate table could not be built
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InitError {
    /// The peer reported no usable rate
    #[error("peer supports no rate")]
    NoRates,
    /// The physical layer reported a transmission time under one microsecond
    #[error("rate {rate} has no transmission time")]
    ZeroDuration {
        /// Offending rate
        rate: RateIndex,
    },
}

#[cfg(test)]
pub(crate) mod tests {
    use proptest::prelude::*;

    use super::*;

    /// Rates whose reference frame takes `durations[i]` microseconds
    pub(crate) struct FixedModes(pub(crate) Vec<u64>);

    impl PeerModes for FixedModes {
        fn candidate_rate_count(&self) -> usize {
            self.0.len()
        }

        fn mode_duration(&self, rate: RateIndex, _: u32) -> Duration {
            Duration::from_micros(self.0[rate])
        }
    }

    fn table(durations: &[u64]) -> RateTable {
        let modes = FixedModes(durations.to_vec());
        RateTable::new(&modes, durations.len(), 1200).unwrap()
    }

    #[test]
    fn builds_with_default_budgets() {
        let table = table(&[2000, 1000, 500]);
        assert_eq!(table.len(), 3);
        for stats in table.iter() {
            assert_eq!(stats.retry_budget(), 1);
            assert_eq!(stats.adjusted_retry_budget(), 1);
            assert_eq!(stats.ewma_probability(), 0);
        }
        assert_eq!(table[1].perfect_duration(), Duration::from_micros(1000));
    }

    #[test]
    fn rejects_degenerate_modes() {
        let modes = FixedModes(vec![1000, 0]);
        assert_eq!(RateTable::new(&modes, 0, 1200), Err(InitError::NoRates));
        assert_eq!(
            RateTable::new(&modes, 2, 1200),
            Err(InitError::ZeroDuration { rate: 1 })
        );
    }

    #[test]
    fn extend_keeps_existing_statistics() {
        let modes = FixedModes(vec![1000, 500, 250]);
        let mut table = RateTable::new(&modes, 2, 1200).unwrap();
        table.record_success(1);
        table.fold(75);
        let before = table[1].clone();

        table.extend(&modes, 3, 1200).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table[1], before);
        assert_eq!(table[2].perfect_duration(), Duration::from_micros(250));

        // never shrinks
        table.extend(&modes, 1, 1200).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn fold_smooths_probability() {
        let mut table = table(&[1000, 500]);
        for _ in 0..3 {
            table.record_success(0);
        }
        table.record_attempts(0, 1);
        table.fold(75);

        let stats = &table[0];
        assert_eq!(stats.probability(), 13_500);
        // (13500 * 25 + 0 * 75) / 100
        assert_eq!(stats.ewma_probability(), 3375);
        assert_eq!(stats.throughput(), 3375 * 1000);
        assert_eq!(stats.lifetime_attempts(), 4);
        assert_eq!(stats.lifetime_successes(), 3);
        assert_eq!(stats.last_attempts(), 4);
        assert_eq!(stats.attempts(), 0);
        assert_eq!(stats.successes(), 0);

        // untouched rates keep their estimates
        assert_eq!(table[1].throughput(), 0);

        // a quiet window leaves the estimates alone but clears the counters
        table.fold(75);
        assert_eq!(table[0].ewma_probability(), 3375);
        assert_eq!(table[0].last_attempts(), 0);
        assert_eq!(table[0].lifetime_attempts(), 4);
    }

    #[test]
    fn adjusts_retry_budget_at_extremes() {
        let mut table = table(&[1000]);
        let stats = table.stats_mut(0);
        stats.retry_budget = 8;

        stats.ewma_probability = PROBABILITY_SCALE;
        stats.fold(75);
        assert_eq!(stats.adjusted_retry_budget(), 2);

        stats.ewma_probability = 9000;
        stats.fold(75);
        assert_eq!(stats.adjusted_retry_budget(), 8);

        stats.retry_budget = 1;
        stats.ewma_probability = 100;
        stats.fold(75);
        assert_eq!(stats.adjusted_retry_budget(), 1);
    }

    #[test]
    fn ranks_with_first_index_winning_ties() {
        let mut table = table(&[1000; 6]);
        for (rate, tp) in [10, 50, 30, 50, 20, 40].into_iter().enumerate() {
            table.stats_mut(rate).throughput = tp;
        }
        assert_eq!(table.best_throughput::<5>(), [1, 3, 5, 2, 4]);
        assert_eq!(table.best_throughput::<2>(), [1, 3]);

        for (rate, p) in [100, 900, 900, 0, 0, 0].into_iter().enumerate() {
            table.stats_mut(rate).ewma_probability = p;
        }
        assert_eq!(table.best_probability(), 1);
    }

    #[test]
    fn ranking_without_data_defaults_to_slowest() {
        let table = table(&[1000; 4]);
        assert_eq!(table.best_throughput::<5>(), [0; 5]);
        assert_eq!(table.best_probability(), 0);
    }

    proptest! {
        #[test]
        fn throughput_formula(p in 0..=PROBABILITY_SCALE, micros in 1u64..100_000) {
            prop_assert_eq!(
                throughput(p, Duration::from_micros(micros)),
                u64::from(p) * (1_000_000 / micros)
            );
        }

        #[test]
        fn estimates_stay_in_range(
            windows in proptest::collection::vec((0u32..50, 0u32..50), 1..20),
            weight in 0u32..=100,
        ) {
            let mut table = table(&[1000]);
            for (successes, failures) in windows {
                for _ in 0..successes {
                    table.record_success(0);
                }
                table.record_attempts(0, failures);
                table.fold(weight);
                let stats = &table[0];
                prop_assert!(stats.probability() <= PROBABILITY_SCALE);
                prop_assert!(stats.ewma_probability() <= PROBABILITY_SCALE);
                prop_assert!(stats.lifetime_successes() <= stats.lifetime_attempts());
                prop_assert_eq!(
                    stats.throughput(),
                    throughput(stats.ewma_probability(), stats.perfect_duration())
                );
            }
        }
    }
}
