use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use slab::Slab;
use tracing::{debug, trace};

use crate::{
    controller::{ControllerFactory, RateController},
    event::Event,
    phy::{PeerView, Phy},
    table::InitError,
    Instant, RateIndex,
};

/// Per-peer rate selection for every station a radio talks to
///
/// Owns one controller per remote peer, built on demand by the configured factory, and routes
/// transmission outcomes reported by the MAC layer to the controller of the peer concerned. The
/// physical layer is consulted for the rates of a peer only when its controller builds or
/// extends its rate table.
pub struct RateManager<P: Phy> {
    phy: P,
    factory: Arc<dyn ControllerFactory + Send + Sync>,
    peers: Slab<Box<dyn RateController>>,
    events: VecDeque<(PeerHandle, Event)>,
}

impl<P: Phy> RateManager<P> {
    /// Create a manager whose peers are served by controllers built by `factory`
    pub fn new(phy: P, factory: Arc<dyn ControllerFactory + Send + Sync>) -> Self {
        Self {
            phy,
            factory,
            peers: Slab::new(),
            events: VecDeque::new(),
        }
    }

    /// The physical layer
    pub fn phy(&self) -> &P {
        &self.phy
    }

    /// Mutable access to the physical layer, e.g. to record newly learned peer capabilities
    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Start tracking a peer first seen at `now`
    pub fn add_peer(&mut self, now: Instant) -> PeerHandle {
        let controller = self.factory.clone().build(now);
        let handle = PeerHandle(self.peers.insert(controller));
        debug!(peer = handle.0, "peer added");
        handle
    }

    /// Stop tracking a peer, returning its controller
    ///
    /// Events the peer queued but that were not polled yet are discarded.
    pub fn remove_peer(&mut self, peer: PeerHandle) -> Option<Box<dyn RateController>> {
        let controller = self.peers.try_remove(peer.0)?;
        self.events.retain(|(handle, _)| *handle != peer);
        debug!(peer = peer.0, "peer removed");
        Some(controller)
    }

    /// Number of tracked peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether no peer is tracked
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The controller serving `peer`, if it is tracked
    pub fn controller(&self, peer: PeerHandle) -> Option<&dyn RateController> {
        self.peers.get(peer.0).map(|c| &**c)
    }

    /// Rate for the next data frame of `frame_size` bytes to `peer`
    ///
    /// # Panics
    ///
    /// If `peer` is not tracked.
    pub fn select_data_rate(
        &mut self,
        peer: PeerHandle,
        now: Instant,
        frame_size: u32,
    ) -> Result<RateIndex, InitError> {
        let view = PeerView {
            phy: &self.phy,
            peer,
        };
        let rate = self.peers[peer.0].select_data_rate(now, &view, frame_size)?;
        trace!(peer = peer.0, rate, "selected data rate");
        self.drain(peer);
        Ok(rate)
    }

    /// Rate for the next control frame to `peer`
    ///
    /// # Panics
    ///
    /// If `peer` is not tracked.
    pub fn select_control_rate(&self, peer: PeerHandle) -> RateIndex {
        self.peers[peer.0].select_control_rate()
    }

    /// A protection exchange with `peer` failed
    pub fn on_rts_failed(&mut self, peer: PeerHandle) {
        self.peers[peer.0].on_rts_failed();
    }

    /// A protection exchange with `peer` succeeded
    pub fn on_rts_succeeded(&mut self, peer: PeerHandle) {
        self.peers[peer.0].on_rts_succeeded();
    }

    /// The protection exchange with `peer` was abandoned
    pub fn on_final_rts_failed(&mut self, peer: PeerHandle) {
        self.peers[peer.0].on_final_rts_failed();
    }

    /// A data transmission to `peer` was not acknowledged
    pub fn on_data_failed(&mut self, peer: PeerHandle, now: Instant) -> Result<(), InitError> {
        let view = PeerView {
            phy: &self.phy,
            peer,
        };
        self.peers[peer.0].on_data_failed(now, &view)?;
        self.drain(peer);
        Ok(())
    }

    /// A data frame to `peer` was acknowledged
    pub fn on_data_succeeded(&mut self, peer: PeerHandle, now: Instant) {
        self.peers[peer.0].on_data_succeeded(now);
        self.drain(peer);
    }

    /// A data frame to `peer` was dropped after exhausting its retries
    pub fn on_final_data_failed(&mut self, peer: PeerHandle, now: Instant) {
        self.peers[peer.0].on_final_data_failed(now);
        self.drain(peer);
    }

    /// Next event raised by any peer's controller
    pub fn poll(&mut self) -> Option<(PeerHandle, Event)> {
        self.events.pop_front()
    }

    fn drain(&mut self, peer: PeerHandle) {
        let controller = &mut self.peers[peer.0];
        while let Some(event) = controller.poll() {
            self.events.push_back((peer, event));
        }
    }
}

impl<P: Phy + fmt::Debug> fmt::Debug for RateManager<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateManager")
            .field("phy", &self.phy)
            .field("peers", &self.peers.len())
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

/// Internal identifier for a peer
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerHandle(pub usize);

impl From<PeerHandle> for usize {
    fn from(x: PeerHandle) -> Self {
        x.0
    }
}
