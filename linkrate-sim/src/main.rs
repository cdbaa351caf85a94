//! Runs linkrate controllers against a synthetic 802.11a/g channel and reports what they achieve

use std::{collections::BTreeMap, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use proto::{
    ControllerFactory, CreditThresholdConfig, Duration, Event, InitialRate, Instant, PeerHandle,
    ProbingConfig, RateManager, StatsConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, trace};

mod channel;
mod phy;

use channel::Link;
use phy::{Ofdm, BASIC_RATES, MBPS};

/// Data attempts per frame, the first transmission included
const DATA_ATTEMPTS: u32 = 8;
/// Protection attempts per frame
const RTS_ATTEMPTS: u32 = 7;
/// Size of an RTS frame in bytes
const RTS_SIZE: u32 = 20;
/// SIFS plus an acknowledgement at the control rate
const ACK_OVERHEAD: Duration = Duration::from_micros(16 + 44);
/// DIFS plus the mean initial backoff
const ACCESS_OVERHEAD: Duration = Duration::from_micros(34 + 67);
/// Largest A-MPDU an 802.11 station may send, in bytes
const MAX_FRAME_SIZE: u32 = 1_048_575;
/// Frames after which a peer advertises all of its rates
const CAPABILITY_FRAMES: u64 = 50;

#[derive(Parser, Debug)]
#[clap(name = "linkrate-sim")]
struct Opt {
    /// Rate selection strategy
    #[clap(long, value_enum, default_value = "credit")]
    strategy: StrategyKind,
    /// Number of peers sharing the radio
    #[clap(long, default_value = "4")]
    peers: usize,
    /// Simulated time to run for, in milliseconds
    #[clap(long = "duration", default_value = "10000")]
    duration_ms: u64,
    /// Payload size of data frames in bytes
    #[clap(long, default_value = "1200")]
    frame_size: u32,
    /// Mean SNR of the peers' links in dB, spread by ±6 dB across peers
    #[clap(long = "snr", default_value = "16")]
    snr_db: f64,
    /// Largest SNR change in dB between two transmissions
    #[clap(long = "drift", default_value = "0.02")]
    drift_db: f64,
    /// Seed of the channel's random number generator
    #[clap(long, default_value = "0")]
    seed: u64,
    /// Protect every data frame with an RTS/CTS exchange
    #[clap(long)]
    rts: bool,
    /// Peers first advertise only the basic rates and the rest after a few frames
    #[clap(long)]
    learn_rates: bool,
    /// Interval between statistics refreshes, in milliseconds
    ///
    /// Defaults to 10 for the credit strategy and 100 for probing.
    #[clap(long = "refresh")]
    refresh_ms: Option<u64>,
    /// Weight in percent of the previous estimate when smoothing success probabilities
    #[clap(long, default_value = "75")]
    ewma_weight: u32,
    /// Rate credit-threshold controllers start from
    #[clap(long, value_enum, default_value = "slowest")]
    initial_rate: StartRate,
    /// Grow the credit-threshold decision window up to this many frames on losses
    #[clap(long)]
    adaptive_window: Option<u32>,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum StrategyKind {
    Credit,
    Probing,
}

#[derive(ValueEnum, Copy, Clone, Debug)]
enum StartRate {
    Slowest,
    Middle,
    Fastest,
}

impl From<StartRate> for InitialRate {
    fn from(x: StartRate) -> Self {
        match x {
            StartRate::Slowest => Self::Slowest,
            StartRate::Middle => Self::Middle,
            StartRate::Fastest => Self::Fastest,
        }
    }
}

fn main() {
    let opt = Opt::parse();
    let code = {
        if let Err(e) = run(opt) {
            eprintln!("ERROR: {e:#}");
            1
        } else {
            0
        }
    };
    ::std::process::exit(code);
}

fn run(opt: Opt) -> Result<()> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .finish(),
    )
    .context("failed to install log subscriber")?;
    if opt.peers == 0 {
        bail!("at least one peer is required");
    }
    if opt.frame_size == 0 || opt.frame_size > MAX_FRAME_SIZE {
        bail!("frame size must be between 1 and {MAX_FRAME_SIZE} bytes");
    }
    let factory = factory(&opt)?;
    let mut sim = Simulation::new(&opt, factory);
    info!(
        strategy = ?opt.strategy,
        peers = opt.peers,
        seed = opt.seed,
        "starting simulation"
    );
    sim.run(Duration::from_millis(opt.duration_ms), opt.frame_size)?;
    sim.report(&opt);
    Ok(())
}

fn factory(opt: &Opt) -> Result<Arc<dyn ControllerFactory + Send + Sync>> {
    let refresh = match (opt.refresh_ms, opt.strategy) {
        (Some(ms), _) => Duration::from_millis(ms),
        (None, StrategyKind::Credit) => Duration::from_millis(10),
        (None, StrategyKind::Probing) => Duration::from_millis(100),
    };
    let mut stats = StatsConfig::default();
    stats
        .refresh_interval(refresh)
        .ewma_weight(opt.ewma_weight)
        .context("invalid EWMA weight")?
        .reference_frame_size(opt.frame_size)
        .context("invalid frame size")?;

    Ok(match opt.strategy {
        StrategyKind::Credit => {
            let mut config = CreditThresholdConfig::default();
            config
                .stats(stats)
                .initial_rate(opt.initial_rate.into())
                .adaptive_window(opt.adaptive_window)
                .context("invalid adaptive window")?;
            Arc::new(config)
        }
        StrategyKind::Probing => {
            let mut config = ProbingConfig::default();
            config.stats(stats);
            Arc::new(config)
        }
    })
}

/// Outcomes of the frames sent to one peer
#[derive(Debug, Default)]
struct PeerStats {
    delivered: u64,
    dropped: u64,
    data_attempts: u64,
    rts_failures: u64,
    /// Delivered frames per rate they were acknowledged at
    delivered_at: BTreeMap<usize, u64>,
}

struct Simulation {
    manager: RateManager<Ofdm>,
    peers: Vec<(PeerHandle, Link, PeerStats)>,
    rng: StdRng,
    rts: bool,
    learn_rates: bool,
    start: Instant,
    now: Instant,
    events: BTreeMap<&'static str, u64>,
}

impl Simulation {
    fn new(opt: &Opt, factory: Arc<dyn ControllerFactory + Send + Sync>) -> Self {
        let start = Instant::now();
        let mut manager = RateManager::new(Ofdm::new(), factory);
        let mut peers = Vec::with_capacity(opt.peers);
        for i in 0..opt.peers {
            let handle = manager.add_peer(start);
            let rates = if opt.learn_rates { BASIC_RATES } else { MBPS.len() };
            manager.phy_mut().set_supported(handle, rates);
            // spread the peers evenly over [snr - 6, snr + 6] dB
            let offset = if opt.peers > 1 {
                12.0 * i as f64 / (opt.peers - 1) as f64 - 6.0
            } else {
                0.0
            };
            let link = Link::new(opt.snr_db + offset, opt.drift_db);
            debug!(peer = handle.0, snr = link.snr_db(), rates, "peer joined");
            peers.push((handle, link, PeerStats::default()));
        }
        Self {
            manager,
            peers,
            rng: StdRng::seed_from_u64(opt.seed),
            rts: opt.rts,
            learn_rates: opt.learn_rates,
            start,
            now: start,
            events: BTreeMap::new(),
        }
    }

    /// Send frames to the peers in turn until `duration` of airtime has elapsed
    fn run(&mut self, duration: Duration, frame_size: u32) -> Result<()> {
        let end = self.start + duration;
        let mut turn = 0;
        while self.now < end {
            self.send_frame(turn, frame_size)?;
            self.drain_events();
            turn = (turn + 1) % self.peers.len();
        }
        Ok(())
    }

    fn send_frame(&mut self, index: usize, frame_size: u32) -> Result<()> {
        let (peer, link, stats) = &mut self.peers[index];
        let peer = *peer;
        let manager = &mut self.manager;
        self.now += ACCESS_OVERHEAD;

        if self.learn_rates && stats.delivered + stats.dropped == CAPABILITY_FRAMES {
            manager.phy_mut().set_supported(peer, MBPS.len());
            debug!(peer = peer.0, "capabilities learned");
        }

        if self.rts {
            let rate = manager.select_control_rate(peer);
            let mut protected = false;
            for _ in 0..RTS_ATTEMPTS {
                self.now += Ofdm::airtime(rate, RTS_SIZE) + ACK_OVERHEAD;
                if link.transmit(&mut self.rng, rate) {
                    manager.on_rts_succeeded(peer);
                    protected = true;
                    break;
                }
                stats.rts_failures += 1;
                manager.on_rts_failed(peer);
            }
            if !protected {
                manager.on_final_rts_failed(peer);
                stats.dropped += 1;
                trace!(peer = peer.0, "frame dropped, medium never reserved");
                return Ok(());
            }
        }

        let mut rate = manager
            .select_data_rate(peer, self.now, frame_size)
            .with_context(|| format!("rate selection for peer {} failed", peer.0))?;
        for _ in 0..DATA_ATTEMPTS {
            self.now += Ofdm::airtime(rate, frame_size) + ACK_OVERHEAD;
            stats.data_attempts += 1;
            if link.transmit(&mut self.rng, rate) {
                manager.on_data_succeeded(peer, self.now);
                stats.delivered += 1;
                *stats.delivered_at.entry(rate).or_default() += 1;
                return Ok(());
            }
            manager
                .on_data_failed(peer, self.now)
                .with_context(|| format!("failure feedback for peer {} failed", peer.0))?;
            rate = manager
                .controller(peer)
                .map_or(0, |controller| controller.state().current_rate());
        }
        manager.on_final_data_failed(peer, self.now);
        stats.dropped += 1;
        trace!(peer = peer.0, rate, "frame dropped");
        Ok(())
    }

    fn drain_events(&mut self) {
        while let Some((peer, event)) = self.manager.poll() {
            let kind = match event {
                Event::Initialized { .. } => "initialized",
                Event::TableExtended { .. } => "table extended",
                Event::StatsRefreshed { .. } => "stats refreshed",
                Event::RateChanged { .. } => "rate changed",
                Event::ProbeStarted { .. } => "probe started",
                Event::ProbeConfirmed { .. } => "probe confirmed",
            };
            trace!(peer = peer.0, ?event);
            *self.events.entry(kind).or_default() += 1;
        }
    }

    fn report(&self, opt: &Opt) {
        let elapsed = self.now.duration_since(self.start).as_secs_f64();
        println!(
            "{:?} strategy, {} peers, {:.2} s simulated",
            opt.strategy,
            self.peers.len(),
            elapsed
        );
        let mut total = 0;
        for (peer, link, stats) in &self.peers {
            total += stats.delivered;
            let goodput = stats.delivered as f64 * f64::from(opt.frame_size) * 8.0 / elapsed / 1e6;
            let rate = self
                .manager
                .controller(*peer)
                .map_or(0, |controller| controller.state().current_rate());
            println!(
                "peer {}: snr {:.1} dB, {} delivered, {} dropped, {:.2} attempts/frame, {:.2} Mb/s, now at {} Mb/s",
                peer.0,
                link.snr_db(),
                stats.delivered,
                stats.dropped,
                stats.data_attempts as f64 / (stats.delivered + stats.dropped).max(1) as f64,
                goodput,
                MBPS[rate],
            );
            if stats.rts_failures > 0 {
                println!("  {} RTS failures", stats.rts_failures);
            }
            for (rate, frames) in &stats.delivered_at {
                println!("  {:>4} Mb/s: {}", MBPS[*rate], frames);
            }
        }
        println!(
            "aggregate goodput {:.2} Mb/s",
            total as f64 * f64::from(opt.frame_size) * 8.0 / elapsed / 1e6
        );
        for (kind, count) in &self.events {
            println!("{kind}: {count}");
        }
    }
}
