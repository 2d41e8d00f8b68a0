//! Point-to-point connection abstraction.
//!
//! A [`PeerConnector`] builds one [`PeerConnection`] per negotiation. The
//! connection exchanges opaque descriptions and candidates through the
//! coordinator and surfaces its results as [`PeerEvent`]s.

use roomdrop_data_channel::DataChannel;
use roomdrop_protocol::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::BoxFuture;
use crate::error::NegotiationError;

/// Capacity of a connection's event queue.
pub const PEER_EVENT_CAPACITY: usize = 32;

/// Events produced by a peer connection.
#[derive(Debug)]
pub enum PeerEvent {
    /// A local candidate to publish to the other participant.
    LocalCandidate(IceCandidate),
    /// The channel created by the remote side is available (Joiner only).
    DataChannel(DataChannel),
    /// The connection failed irrecoverably.
    Failed(String),
}

/// Builds peer connections.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
    ) -> BoxFuture<'_, Result<(Box<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError>>;
}

/// One side of a point-to-point connection under negotiation.
pub trait PeerConnection: Send {
    /// Creates the local data channel. Only the offering side calls this.
    ///
    /// The channel stays `Connecting` until the connection is established.
    fn create_data_channel(&mut self, label: &str) -> Result<DataChannel, NegotiationError>;

    fn create_offer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>>;

    /// Produces the answer to the remote offer applied before.
    fn create_answer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>>;

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), NegotiationError>>;

    fn add_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), NegotiationError>>;

    /// Tears the connection down. Idempotent.
    fn close(&mut self);
}
