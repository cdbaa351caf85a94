use std::any::Any;
use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use super::{Decision, RateController, Strategy};
use crate::{
    event::{Cause, Event},
    peer::PeerState,
    phy::PeerModes,
    refresh,
    table::{InitError, RateTable},
    Instant, RateIndex, FALLBACK_LONG_RETRIES, STEP_DOWN_LONG_RETRIES,
};

/// Rate controller for one peer, parameterized by its decision [`Strategy`]
///
/// Tracks delivery outcomes per rate, refreshes the estimates periodically and lets the
/// strategy pick the next rate. Each engine owns the rate table of its peer; nothing is shared
/// between peers.
#[derive(Debug, Clone)]
pub struct Engine<S> {
    state: PeerState,
    table: Option<RateTable>,
    strategy: S,
    events: VecDeque<Event>,
}

impl<S: Strategy> Engine<S> {
    /// Construct a controller driven by `strategy` for a peer first seen at `now`
    pub fn with_strategy(strategy: S, now: Instant) -> Self {
        let state = PeerState::new(
            now + strategy.stats().refresh_interval,
            now + strategy.adapt_period(),
        );
        Self {
            state,
            table: None,
            strategy,
            events: VecDeque::new(),
        }
    }

    /// The decision strategy
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Build the rate table once the peer reports more than one rate, or extend it if the peer
    /// gained rates since
    fn ensure_initialized(&mut self, modes: &dyn PeerModes) -> Result<(), InitError> {
        let count = modes.candidate_rate_count();
        let frame_size = self.strategy.stats().reference_frame_size;
        match self.table {
            None if count > 1 => {
                let table = RateTable::new(modes, count, frame_size).map_err(|e| {
                    warn!("failed to build rate table: {}", e);
                    e
                })?;
                self.table = Some(table);
                self.state.candidate_count = count;
                self.state.initialized = true;
                self.state.switch(self.strategy.initial_rate(count));
                debug!(rates = count, rate = self.state.current_rate, "initialized");
                self.events.push_back(Event::Initialized { rates: count });
            }
            Some(ref mut table) if count > self.state.candidate_count => {
                table.extend(modes, count, frame_size).map_err(|e| {
                    warn!("failed to extend rate table: {}", e);
                    e
                })?;
                self.state.candidate_count = count;
                debug!(rates = count, "rate table extended");
                self.events.push_back(Event::TableExtended { rates: count });
            }
            _ => {}
        }
        Ok(())
    }

    /// Run the decision logic outside of a statistics refresh
    fn decide(&mut self, now: Instant) {
        let Some(table) = &self.table else {
            return;
        };
        self.strategy.decide(Decision {
            now,
            state: &mut self.state,
            table,
            events: &mut self.events,
        });
    }

    /// Lower the rate for the remainder of the frame in flight
    fn fall_back(&mut self, rate: RateIndex) {
        let from = self.state.current_rate;
        if rate == from {
            return;
        }
        if self.state.pending_retry_rate.is_none() {
            self.state.pending_retry_rate = Some(self.state.decided_rate);
        }
        self.state.current_rate = rate;
        debug!(from, to = rate, long_retry = self.state.long_retry, "falling back");
        self.events.push_back(Event::RateChanged {
            from,
            to: rate,
            cause: Cause::Fallback,
        });
    }

    fn restore_pending_rate(&mut self) {
        if let Some(from) = self.state.restore_pending_rate() {
            let to = self.state.current_rate;
            if from != to {
                trace!(from, to, "restored decided rate");
                self.events.push_back(Event::RateChanged {
                    from,
                    to,
                    cause: Cause::RetryRestored,
                });
            }
        }
    }

    /// Charge the retries of the resolved frame to the current rate, if the table exists
    fn charge_retries(&mut self) {
        self.state.consolidate_retries();
        if let Some(table) = &mut self.table {
            table.record_attempts(self.state.current_rate, self.state.retry_count);
        }
    }
}

impl<S: Strategy> RateController for Engine<S> {
    fn select_data_rate(
        &mut self,
        now: Instant,
        modes: &dyn PeerModes,
        _frame_size: u32,
    ) -> Result<RateIndex, InitError> {
        self.ensure_initialized(modes)?;
        if let Some(table) = &mut self.table {
            refresh::refresh_if_due(
                now,
                &mut self.state,
                table,
                &mut self.strategy,
                &mut self.events,
            );
            self.strategy.on_select(now, &mut self.state);
        }
        Ok(self.state.current_rate)
    }

    fn on_rts_failed(&mut self) {
        self.state.short_retry += 1;
        trace!(short_retry = self.state.short_retry, "rts failed");
    }

    fn on_rts_succeeded(&mut self) {
        trace!("rts ok");
    }

    fn on_final_rts_failed(&mut self) {
        self.state.consolidate_retries();
        self.state.err_count += 1;
        trace!(retries = self.state.retry_count, "rts abandoned");
    }

    fn on_data_failed(&mut self, now: Instant, modes: &dyn PeerModes) -> Result<(), InitError> {
        self.ensure_initialized(modes)?;
        if !self.state.initialized {
            return Ok(());
        }

        self.state.long_retry += 1;
        self.strategy.on_data_failed();
        trace!(
            rate = self.state.current_rate,
            long_retry = self.state.long_retry,
            "data failed"
        );

        if self.state.long_retry > FALLBACK_LONG_RETRIES {
            self.fall_back(0);
        } else if self.state.long_retry >= STEP_DOWN_LONG_RETRIES {
            self.fall_back(self.state.current_rate.saturating_sub(1));
        } else if self.strategy.decides_on_feedback() {
            self.decide(now);
        }
        Ok(())
    }

    fn on_data_succeeded(&mut self, now: Instant) {
        self.restore_pending_rate();
        if !self.state.initialized {
            return;
        }
        self.strategy.on_data_succeeded();
        if let Some(table) = &mut self.table {
            table.record_success(self.state.current_rate);
        }
        self.charge_retries();
        self.state.ok_count += 1;
        self.state.frames_ok += 1;
        trace!(
            rate = self.state.current_rate,
            retries = self.state.retry_count,
            "data ok"
        );

        if self.strategy.decides_on_feedback() {
            self.decide(now);
        }
    }

    fn on_final_data_failed(&mut self, _now: Instant) {
        self.restore_pending_rate();
        self.charge_retries();
        self.state.err_count += 1;
        self.state.frames_failed += 1;
        trace!(retries = self.state.retry_count, "data abandoned");
    }

    fn state(&self) -> &PeerState {
        &self.state
    }

    fn table(&self) -> Option<&RateTable> {
        self.table.as_ref()
    }

    fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    fn clone_box(&self) -> Box<dyn RateController> {
        Box::new(self.clone())
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}
