use crate::RateIndex;

/// Observable changes in the state of a rate controller
///
/// Controllers queue events as they happen; they are retrieved with
/// [`RateController::poll`](crate::RateController::poll) and carry no weight in the decision
/// logic itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The rate table was built
    Initialized {
        /// Number of candidate rates
        rates: usize,
    },
    /// The peer gained rates after the table was built
    TableExtended {
        /// New number of candidate rates
        rates: usize,
    },
    /// Statistics were refreshed and candidates re-ranked
    StatsRefreshed {
        /// Rate with the highest estimated throughput
        best_throughput: RateIndex,
        /// Rate with the highest smoothed success probability
        best_probability: RateIndex,
    },
    /// The rate used for data frames changed
    RateChanged {
        /// Previous rate
        from: RateIndex,
        /// New rate
        to: RateIndex,
        /// What triggered the change
        cause: Cause,
    },
    /// A faster rate is being tried
    ProbeStarted {
        /// Rate the probe started from
        from: RateIndex,
        /// Rate under test
        to: RateIndex,
    },
    /// A probed rate outperformed the rate it was tried from
    ProbeConfirmed {
        /// Rate kept
        rate: RateIndex,
    },
}

/// Reason for a [`Event::RateChanged`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cause {
    /// The decision logic moved the rate
    Decision,
    /// Repeated data failures pushed the rate down for the frame in flight
    Fallback,
    /// The refresh found a faster rate with the best throughput
    BestThroughput,
    /// The decided rate was put back after a fallback
    RetryRestored,
    /// A probe was abandoned for the rate it started from
    ProbeReverted,
}
