use std::collections::VecDeque;

use tracing::{debug, trace};

use crate::{
    controller::{Decision, Strategy},
    event::{Cause, Event},
    peer::{PeerState, RANKED_RATES},
    table::RateTable,
    Instant,
};

/// Refresh the statistics of a peer if its deadline has passed
///
/// Folds the window that just ended into the estimates, re-ranks the candidates and runs the
/// decision logic. Returns whether a refresh happened.
pub(crate) fn refresh_if_due<S: Strategy>(
    now: Instant,
    state: &mut PeerState,
    table: &mut RateTable,
    strategy: &mut S,
    events: &mut VecDeque<Event>,
) -> bool {
    if now < state.next_stats_deadline || !state.initialized {
        return false;
    }
    let stats = strategy.stats();
    state.next_stats_deadline = now + stats.refresh_interval;

    table.fold(stats.ewma_weight);
    for (rate, entry) in table.iter().enumerate() {
        trace!(
            rate,
            attempts = entry.last_attempts(),
            successes = entry.last_successes(),
            ewma = entry.ewma_probability(),
            throughput = entry.throughput(),
            "folded window"
        );
    }

    let ranked = strategy.ranked_rates().min(RANKED_RATES);
    let mut best = table.best_throughput::<RANKED_RATES>();
    best[ranked..].fill(0);
    state.best_throughput = best;
    state.best_probability = table.best_probability();
    debug!(
        best_throughput = ?&best[..ranked],
        best_probability = state.best_probability,
        "refreshed statistics"
    );
    events.push_back(Event::StatsRefreshed {
        best_throughput: best[0],
        best_probability: state.best_probability,
    });

    let mut decision = Decision {
        now,
        state,
        table,
        events,
    };
    if strategy.raises_to_best() && best[0] > decision.state.current_rate {
        decision.change(best[0], Cause::BestThroughput, false);
    }
    strategy.decide(decision);
    true
}
