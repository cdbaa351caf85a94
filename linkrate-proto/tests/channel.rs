use std::sync::Arc;

use linkrate_proto::{
    Cause, ControllerFactory, CreditThresholdConfig, Duration, Event, Instant, PeerHandle, Phy,
    ProbingConfig, RateIndex, RateManager,
};
use tracing::subscriber::DefaultGuard;

const RATES: usize = 8;
/// Attempts per frame, the first transmission included
const ATTEMPTS: u32 = 8;

/// A channel on which every rate up to `max_working` delivers and every faster rate loses
#[derive(Debug)]
struct ThresholdPhy {
    max_working: RateIndex,
}

impl Phy for ThresholdPhy {
    fn candidate_rate_count(&self, _: PeerHandle) -> usize {
        RATES
    }

    fn mode_duration(&self, _: PeerHandle, rate: RateIndex, _: u32) -> Duration {
        Duration::from_micros(4000 / (rate as u64 + 1))
    }
}

/// Outcome of one frame exchange
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Acked { rate: RateIndex, attempts: u32 },
    Dropped,
}

/// Minimal MAC: retry a frame until acknowledged or out of attempts, one attempt per millisecond
struct Mac {
    manager: RateManager<ThresholdPhy>,
    peer: PeerHandle,
    now: Instant,
    /// Controller events, stamped with the time of the call that raised them
    events: Vec<(Instant, Event)>,
}

impl Mac {
    fn new(max_working: RateIndex, factory: Arc<dyn ControllerFactory + Send + Sync>) -> Self {
        let now = Instant::now();
        let mut manager = RateManager::new(ThresholdPhy { max_working }, factory);
        let peer = manager.add_peer(now);
        Self {
            manager,
            peer,
            now,
            events: Vec::new(),
        }
    }

    fn send(&mut self) -> Delivery {
        let mut rate = self
            .manager
            .select_data_rate(self.peer, self.now, 1200)
            .unwrap();
        self.collect();
        for attempt in 1..=ATTEMPTS {
            self.now += Duration::from_millis(1);
            if rate <= self.manager.phy().max_working {
                self.manager.on_data_succeeded(self.peer, self.now);
                self.collect();
                return Delivery::Acked {
                    rate,
                    attempts: attempt,
                };
            }
            self.manager.on_data_failed(self.peer, self.now).unwrap();
            self.collect();
            rate = self.current_rate();
        }
        self.manager.on_final_data_failed(self.peer, self.now);
        self.collect();
        Delivery::Dropped
    }

    fn collect(&mut self) {
        while let Some((peer, event)) = self.manager.poll() {
            assert_eq!(peer, self.peer);
            self.events.push((self.now, event));
        }
    }

    fn current_rate(&self) -> RateIndex {
        self.manager
            .controller(self.peer)
            .unwrap()
            .state()
            .current_rate()
    }

    fn lifetime_successes(&self) -> Vec<u64> {
        let controller = self.manager.controller(self.peer).unwrap();
        let table = controller.table().unwrap();
        table
            .iter()
            .map(|stats| stats.lifetime_successes() + stats.successes())
            .collect()
    }
}

fn subscribe() -> DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

#[test]
fn credit_climbs_one_rate_per_hundred_frames() {
    let _guard = subscribe();
    let mut mac = Mac::new(RATES - 1, Arc::new(CreditThresholdConfig::default()));
    for step in 0..RATES {
        assert_eq!(mac.current_rate(), step);
        for _ in 0..100 {
            assert_eq!(
                mac.send(),
                Delivery::Acked {
                    rate: step,
                    attempts: 1
                }
            );
        }
    }
    assert_eq!(mac.current_rate(), RATES - 1);
}

#[test]
fn credit_delivers_over_lossy_rates() {
    let _guard = subscribe();
    let mut mac = Mac::new(4, Arc::new(CreditThresholdConfig::default()));
    for _ in 0..2000 {
        match mac.send() {
            Delivery::Acked { rate, .. } => assert!(rate <= 4),
            Delivery::Dropped => panic!("frame dropped"),
        }
    }

    let successes = mac.lifetime_successes();
    assert_eq!(successes.iter().sum::<u64>(), 2000);

    let controller = mac.manager.controller(mac.peer).unwrap();
    assert_eq!(controller.state().frames_ok(), 2000);
    assert_eq!(controller.state().frames_failed(), 0);
    for stats in controller.table().unwrap().iter() {
        assert!(stats.lifetime_successes() <= stats.lifetime_attempts());
    }
}

#[test]
fn probing_backs_off_after_reverting() {
    let _guard = subscribe();
    let backoff = Duration::from_millis(900);
    let mut config = ProbingConfig::default();
    config
        .revert_interval_additive(backoff)
        .revert_interval_multiplicative(backoff);
    let mut mac = Mac::new(4, Arc::new(config));
    for _ in 0..5000 {
        match mac.send() {
            Delivery::Acked { rate, .. } => assert!(rate <= 4),
            Delivery::Dropped => panic!("frame dropped"),
        }
    }

    let mut reverts = 0;
    let mut probe_from = None;
    // Time of the last revert that still holds back the next attempt at a faster rate
    let mut backing_off: Option<Instant> = None;
    for (at, event) in &mac.events {
        match *event {
            Event::ProbeStarted { from, to } => {
                assert!(from < to && to < RATES);
                if let Some(reverted_at) = backing_off.take() {
                    assert!(
                        *at - reverted_at >= backoff,
                        "rate raised again {:?} after a revert",
                        *at - reverted_at
                    );
                }
                probe_from = Some(from);
            }
            Event::RateChanged {
                from,
                to,
                cause: Cause::ProbeReverted,
            } => {
                assert!(from < RATES);
                assert_eq!(Some(to), probe_from, "reverts return to where the rate was raised");
                assert!(to <= 4, "reverted to a failing rate");
                reverts += 1;
                // stepping down at the slowest rate clears oscillations without an event
                backing_off = (to > 0).then_some(*at);
            }
            Event::RateChanged {
                from,
                to,
                cause: Cause::Decision,
            } => {
                assert!(from < RATES && to < RATES);
                if to < from {
                    backing_off = None;
                }
            }
            Event::RateChanged { from, to, .. } => assert!(from < RATES && to < RATES),
            _ => {}
        }
    }
    assert!(reverts > 0, "raises above the working range are reverted");
}
