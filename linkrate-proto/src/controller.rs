//! Logic for choosing the rate at which frames are transmitted

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::{
    event::{Cause, Event},
    peer::PeerState,
    phy::PeerModes,
    table::{InitError, RateTable},
    Duration, Instant, RateIndex, StatsConfig,
};

mod credit;
mod engine;
mod probing;

pub use credit::{CreditStrategy, CreditThreshold, CreditThresholdConfig, InitialRate};
pub use engine::Engine;
pub use probing::{ProbeState, ProbeStrategy, Probing, ProbingConfig};

/// Common interface for different rate controllers
///
/// One controller serves one peer. Transmission outcomes are reported as they happen and the
/// rate for the next data frame is requested before each transmission.
pub trait RateController: Send + Sync {
    /// Rate to use for the next data frame of `frame_size` bytes
    ///
    /// Builds the rate table on first use and refreshes statistics when due. Returns the
    /// slowest rate until the peer reports more than one candidate rate.
    fn select_data_rate(
        &mut self,
        now: Instant,
        modes: &dyn PeerModes,
        frame_size: u32,
    ) -> Result<RateIndex, InitError>;

    /// Rate to use for control frames, always the slowest and most robust one
    fn select_control_rate(&self) -> RateIndex {
        0
    }

    /// A protection exchange (e.g. RTS/CTS) for the frame in flight failed
    fn on_rts_failed(&mut self);

    /// A protection exchange succeeded
    fn on_rts_succeeded(&mut self) {}

    /// The protection exchange was abandoned after exhausting its retries
    fn on_final_rts_failed(&mut self);

    /// A data transmission was not acknowledged and will be retried
    fn on_data_failed(&mut self, now: Instant, modes: &dyn PeerModes) -> Result<(), InitError>;

    /// A data frame was acknowledged
    fn on_data_succeeded(&mut self, now: Instant);

    /// A data frame was dropped after exhausting its retries
    fn on_final_data_failed(&mut self, now: Instant);

    /// Per-peer selection state
    fn state(&self) -> &PeerState;

    /// Per-rate statistics, once the table is built
    fn table(&self) -> Option<&RateTable>;

    /// Next queued observability event
    fn poll(&mut self) -> Option<Event>;

    /// Duplicate the controller's state
    fn clone_box(&self) -> Box<dyn RateController>;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory {
    /// Construct a fresh `RateController` for a peer first seen at `now`
    fn build(self: Arc<Self>, now: Instant) -> Box<dyn RateController>;
}

/// Decision logic plugged into an [`Engine`]
///
/// The engine owns feedback bookkeeping, table construction and statistics refreshes; a
/// strategy only decides which rate to use next and when it wants to be asked.
pub trait Strategy: fmt::Debug + Clone + Send + Sync + 'static {
    /// Statistics parameters
    fn stats(&self) -> &StatsConfig;

    /// Number of best-throughput rates to rank at each refresh, at most 5
    fn ranked_rates(&self) -> usize;

    /// Whether a refresh jumps straight to a faster best-throughput rate
    fn raises_to_best(&self) -> bool {
        false
    }

    /// Whether to run the decision logic on every data outcome as well as on refreshes
    fn decides_on_feedback(&self) -> bool {
        false
    }

    /// Rate to start from once `candidates` rates are known
    #[allow(unused_variables)]
    fn initial_rate(&self, candidates: usize) -> RateIndex {
        0
    }

    /// Period after which [`Strategy::on_select`] deadlines expire
    fn adapt_period(&self) -> Duration {
        self.stats().refresh_interval
    }

    /// A data transmission failed
    fn on_data_failed(&mut self) {}

    /// A data frame was acknowledged
    fn on_data_succeeded(&mut self) {}

    /// A data rate was requested, after any statistics refresh
    #[allow(unused_variables)]
    fn on_select(&mut self, now: Instant, state: &mut PeerState) {}

    /// Choose the next rate
    fn decide(&mut self, decision: Decision<'_>);
}

/// Everything a [`Strategy`] may look at or change while deciding
pub struct Decision<'a> {
    pub(crate) now: Instant,
    pub(crate) state: &'a mut PeerState,
    pub(crate) table: &'a RateTable,
    pub(crate) events: &'a mut VecDeque<Event>,
}

impl Decision<'_> {
    /// Time of the request that triggered the decision
    pub fn now(&self) -> Instant {
        self.now
    }

    /// State of the peer
    pub fn state(&self) -> &PeerState {
        &*self.state
    }

    /// Statistics of the peer's rates
    pub fn table(&self) -> &RateTable {
        self.table
    }

    /// Switch to `rate` and start a new observation window, if it differs from the current rate
    pub fn commit(&mut self, rate: RateIndex) {
        self.change(rate, Cause::Decision, true);
    }

    /// Queue an observability event
    pub fn emit(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub(crate) fn change(&mut self, rate: RateIndex, cause: Cause, new_window: bool) {
        let from = self.state.current_rate;
        if rate == from {
            return;
        }
        if new_window {
            self.state.commit(rate);
        } else {
            self.state.switch(rate);
        }
        tracing::debug!(from, to = rate, ?cause, "rate changed");
        self.events.push_back(Event::RateChanged {
            from,
            to: rate,
            cause,
        });
    }
}
