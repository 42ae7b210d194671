//! Transport seam: the interfaces the engine requires from the outside.
//!
//! The crate does not ship a production transport. Anything that can
//! register a short identifier with a rendezvous service and hand back an
//! ordered, reliable, message-boundary-preserving channel (a WebRTC data
//! channel, a QUIC stream, a plain socket with length framing) plugs in
//! through these traits. The loopback implementation in
//! [`memory`](super::memory) serves tests and single-process embedders.

use crate::core::connection::identifier::PeerId;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events delivered by a channel to its owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound frame, message boundaries preserved.
    Message(Bytes),
    /// The channel closed (remote close, network drop, local teardown).
    /// No further events follow.
    Closed,
}

/// One half of an open peer-to-peer channel.
///
/// Implementations must deliver frames reliably and in send order.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Queue a frame for delivery. Fails (rather than panicking or
    /// blocking) when the channel is no longer open.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Bytes queued locally but not yet handed to the network; the
    /// backpressure signal.
    async fn buffered_amount(&self) -> usize;

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Close the channel. Idempotent.
    async fn close(&self);
}

/// An open channel plus its event stream, as handed out by signaling.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// The rendezvous/identifier registry.
///
/// Treated as a black box providing session establishment; the only
/// contract is that a successfully connected channel is ordered,
/// reliable, and message-boundary-preserving.
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Claim `id` and start listening for inbound connections; each
    /// accepted peer arrives as a [`ChannelHandle`] on the returned
    /// stream. Fails with [`SignalingError::IdentifierTaken`] when
    /// another live session holds the identifier.
    ///
    /// [`SignalingError::IdentifierTaken`]: crate::error::SignalingError::IdentifierTaken
    async fn register(&self, id: &PeerId) -> Result<mpsc::UnboundedReceiver<ChannelHandle>>;

    /// Dial the peer registered as `id`. Resolves once the channel is
    /// open.
    async fn connect(&self, id: &PeerId) -> Result<ChannelHandle>;

    /// Release a claimed identifier. Idempotent; unknown identifiers are
    /// ignored.
    async fn release(&self, id: &PeerId);
}
