//! Low-level rate adaptation logic for wireless links
//!
//! linkrate-proto contains a fully deterministic implementation of per-peer transmission rate
//! selection. It contains no radio code and does not get any timestamps from the operating
//! system: every time-dependent operation is handed the current `Instant` by the caller, so the
//! same logic can be driven by a discrete-event simulator or a real MAC layer.
//!
//! The most important types are `RateManager`, which keeps one `RateController` per remote peer
//! and forwards transmission outcomes to it, and the two controllers themselves:
//! [`CreditThreshold`], a hysteresis strategy that raises the rate after sustained success, and
//! [`Probing`], which tests faster rates aggressively and backs off when it detects oscillation.

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]

pub use std::time::{Duration, Instant};

mod config;
pub use crate::config::{ConfigError, StatsConfig};

pub mod controller;
pub use crate::controller::{
    ControllerFactory, CreditThreshold, CreditThresholdConfig, Decision, Engine, InitialRate,
    Probing, ProbingConfig, RateController, Strategy,
};

mod event;
pub use crate::event::{Cause, Event};

mod manager;
pub use crate::manager::{PeerHandle, RateManager};

mod peer;
pub use crate::peer::PeerState;

mod phy;
pub use crate::phy::{PeerModes, Phy};

mod refresh;

mod table;
pub use crate::table::{InitError, RateStats, RateTable, PROBABILITY_SCALE};

/// Index of a candidate rate, slowest first
pub type RateIndex = usize;

/// Number of long retries after which the slowest rate is forced
const FALLBACK_LONG_RETRIES: u32 = 6;

/// Long retry count from which each further failure steps the rate down by one
const STEP_DOWN_LONG_RETRIES: u32 = 5;
