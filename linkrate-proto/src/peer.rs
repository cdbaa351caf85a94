use crate::{Instant, RateIndex};

/// Number of best-throughput rates tracked as hints
pub(crate) const RANKED_RATES: usize = 5;

/// Mutable rate selection state of one peer
///
/// Counters named `*_count` describe the current observation window of the decision logic and
/// are cleared whenever the rate changes.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub(crate) current_rate: RateIndex,
    /// Rate last committed by the decision logic, before any failure fallback
    pub(crate) decided_rate: RateIndex,
    /// Rate to restore once the frame being retried resolves
    pub(crate) pending_retry_rate: Option<RateIndex>,

    pub(crate) ok_count: u32,
    pub(crate) err_count: u32,
    pub(crate) retry_count: u32,
    pub(crate) credit: u32,
    pub(crate) short_retry: u32,
    pub(crate) long_retry: u32,

    pub(crate) next_stats_deadline: Instant,
    pub(crate) next_interval_deadline: Instant,

    pub(crate) best_throughput: [RateIndex; RANKED_RATES],
    pub(crate) best_probability: RateIndex,

    pub(crate) initialized: bool,
    pub(crate) candidate_count: usize,

    pub(crate) frames_ok: u64,
    pub(crate) frames_failed: u64,
}

impl PeerState {
    pub(crate) fn new(next_stats_deadline: Instant, next_interval_deadline: Instant) -> Self {
        Self {
            current_rate: 0,
            decided_rate: 0,
            pending_retry_rate: None,
            ok_count: 0,
            err_count: 0,
            retry_count: 0,
            credit: 0,
            short_retry: 0,
            long_retry: 0,
            next_stats_deadline,
            next_interval_deadline,
            best_throughput: [0; RANKED_RATES],
            best_probability: 0,
            initialized: false,
            candidate_count: 0,
            frames_ok: 0,
            frames_failed: 0,
        }
    }

    /// Rate used for the next data frame
    pub fn current_rate(&self) -> RateIndex {
        self.current_rate
    }

    /// Rate most recently chosen by the decision logic
    pub fn decided_rate(&self) -> RateIndex {
        self.decided_rate
    }

    /// Rate restored once the frame currently being retried resolves
    pub fn pending_retry_rate(&self) -> Option<RateIndex> {
        self.pending_retry_rate
    }

    /// Frames acknowledged in the current observation window
    pub fn ok_count(&self) -> u32 {
        self.ok_count
    }

    /// Frames dropped in the current observation window
    pub fn err_count(&self) -> u32 {
        self.err_count
    }

    /// Retries consumed by the most recently resolved frames
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Evidence of sustained success accumulated towards the next rate increase
    pub fn credit(&self) -> u32 {
        self.credit
    }

    /// Failed protection exchanges of the frame in flight
    pub fn short_retry(&self) -> u32 {
        self.short_retry
    }

    /// Failed data transmissions of the frame in flight
    pub fn long_retry(&self) -> u32 {
        self.long_retry
    }

    /// Earliest time of the next statistics refresh
    pub fn next_stats_deadline(&self) -> Instant {
        self.next_stats_deadline
    }

    /// Earliest time of the next re-probe interval adaptation
    pub fn next_interval_deadline(&self) -> Instant {
        self.next_interval_deadline
    }

    /// Rates with the highest estimated throughput at the last refresh, best first
    ///
    /// Strategies that rank fewer rates leave the remaining slots at 0.
    pub fn best_throughput(&self) -> &[RateIndex; RANKED_RATES] {
        &self.best_throughput
    }

    /// Rate with the highest smoothed success probability at the last refresh
    pub fn best_probability(&self) -> RateIndex {
        self.best_probability
    }

    /// Whether the rate table has been built
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Number of rates covered by the rate table
    pub fn candidate_count(&self) -> usize {
        self.candidate_count
    }

    /// Frames acknowledged over the lifetime of the peer
    pub fn frames_ok(&self) -> u64 {
        self.frames_ok
    }

    /// Frames dropped after exhausting their retries over the lifetime of the peer
    pub fn frames_failed(&self) -> u64 {
        self.frames_failed
    }

    /// Move the retries of the resolved frame into `retry_count`
    pub(crate) fn consolidate_retries(&mut self) {
        self.retry_count = self.short_retry + self.long_retry;
        self.short_retry = 0;
        self.long_retry = 0;
    }

    /// Put back the decided rate after a fallback, if one is pending
    ///
    /// Returns the rate that was in use when a restore happened.
    pub(crate) fn restore_pending_rate(&mut self) -> Option<RateIndex> {
        let rate = self.pending_retry_rate.take()?;
        let fallback = self.current_rate;
        self.current_rate = rate;
        Some(fallback)
    }

    /// Switch to `rate` as the outcome of a decision, clearing the observation window
    pub(crate) fn commit(&mut self, rate: RateIndex) {
        self.switch(rate);
        self.reset_window();
        self.credit = 0;
    }

    /// Switch to `rate`, keeping the observation window
    ///
    /// Supersedes any rate waiting to be restored after a fallback.
    pub(crate) fn switch(&mut self, rate: RateIndex) {
        assert!(
            rate < self.candidate_count,
            "rate {rate} out of {} candidates",
            self.candidate_count
        );
        self.current_rate = rate;
        self.decided_rate = rate;
        self.pending_retry_rate = None;
    }

    pub(crate) fn reset_window(&mut self) {
        self.ok_count = 0;
        self.err_count = 0;
        self.retry_count = 0;
    }
}
