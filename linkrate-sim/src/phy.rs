use proto::{Duration, PeerHandle, Phy, RateIndex};

/// Data bits carried per OFDM symbol by each 802.11a/g rate, slowest first
const BITS_PER_SYMBOL: [u64; 8] = [24, 36, 48, 72, 96, 144, 192, 216];
/// Nominal rate of each mode in Mb/s
pub(crate) const MBPS: [f64; 8] = [6.0, 9.0, 12.0, 18.0, 24.0, 36.0, 48.0, 54.0];

/// Short and long training sequences plus the SIGNAL symbol
const PREAMBLE_MICROS: u64 = 20;
const SYMBOL_MICROS: u64 = 4;
const SERVICE_BITS: u64 = 16;
const TAIL_BITS: u64 = 6;

/// Rates every 802.11a station supports before its capabilities are known
pub(crate) const BASIC_RATES: usize = 3;

/// 802.11a/g OFDM physical layer shared by all peers of a station
#[derive(Debug)]
pub(crate) struct Ofdm {
    /// Number of rates each peer is known to support
    supported: Vec<usize>,
}

impl Ofdm {
    pub(crate) fn new() -> Self {
        Self {
            supported: Vec::new(),
        }
    }

    /// Record that `peer` supports the `rates` slowest modes
    pub(crate) fn set_supported(&mut self, peer: PeerHandle, rates: usize) {
        let rates = rates.min(BITS_PER_SYMBOL.len());
        if self.supported.len() <= peer.0 {
            self.supported.resize(peer.0 + 1, 0);
        }
        self.supported[peer.0] = rates;
    }

    /// Airtime of one frame of `frame_size` bytes at `rate`
    pub(crate) fn airtime(rate: RateIndex, frame_size: u32) -> Duration {
        let bits = SERVICE_BITS + 8 * u64::from(frame_size) + TAIL_BITS;
        let per_symbol = BITS_PER_SYMBOL[rate];
        let symbols = (bits + per_symbol - 1) / per_symbol;
        Duration::from_micros(PREAMBLE_MICROS + SYMBOL_MICROS * symbols)
    }
}

impl Phy for Ofdm {
    fn candidate_rate_count(&self, peer: PeerHandle) -> usize {
        self.supported.get(peer.0).copied().unwrap_or(0)
    }

    fn mode_duration(&self, _peer: PeerHandle, rate: RateIndex, frame_size: u32) -> Duration {
        Self::airtime(rate, frame_size)
    }
}
