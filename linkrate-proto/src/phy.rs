use crate::{manager::PeerHandle, Duration, RateIndex};

/// Rates available for transmissions to a single peer
///
/// Implemented by the physical layer, or by a view of it scoped to one peer. Controllers query
/// it only while building or extending their rate table.
pub trait PeerModes {
    /// Number of rates the peer supports
    ///
    /// May grow over the lifetime of a peer as capabilities are learned, but never shrinks.
    fn candidate_rate_count(&self) -> usize;

    /// Time needed to transmit a frame of `frame_size` bytes at `rate`
    fn mode_duration(&self, rate: RateIndex, frame_size: u32) -> Duration;
}

/// Physical layer collaborator of a [`RateManager`](crate::RateManager)
pub trait Phy {
    /// Number of rates `peer` supports
    fn candidate_rate_count(&self, peer: PeerHandle) -> usize;

    /// Time needed to transmit a frame of `frame_size` bytes to `peer` at `rate`
    fn mode_duration(&self, peer: PeerHandle, rate: RateIndex, frame_size: u32) -> Duration;
}

/// A [`Phy`] seen from one peer
pub(crate) struct PeerView<'a, P: ?Sized> {
    pub(crate) phy: &'a P,
    pub(crate) peer: PeerHandle,
}

impl<P: Phy + ?Sized> PeerModes for PeerView<'_, P> {
    fn candidate_rate_count(&self) -> usize {
        self.phy.candidate_rate_count(self.peer)
    }

    fn mode_duration(&self, rate: RateIndex, frame_size: u32) -> Duration {
        self.phy.mode_duration(self.peer, rate, frame_size)
    }
}
