//! Rendezvous (signaling) transport abstraction.

use roomdrop_protocol::{RoomId, SignalingMessage};
use tokio::sync::mpsc;

use crate::BoxFuture;
use crate::error::RendezvousError;

/// Room lifecycle and relayed signaling, as seen by one participant.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    /// This participant created the room.
    Created { peer_id: String },
    /// This participant joined an existing room, or another peer joined
    /// the room this participant created.
    Joined { peer_id: String },
    /// The room now holds two participants.
    Ready,
    /// A signaling message relayed from the other participant.
    Message(SignalingMessage),
    /// The room already holds two participants.
    Full,
    /// The other participant left the room.
    PeerLeft,
    /// The rendezvous transport is gone.
    Disconnected,
}

impl RoomEvent {
    /// Events about room membership, as opposed to relayed signaling.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

/// Client side of a rendezvous service.
///
/// Implemented over WebSocket by `roomdrop-rendezvous` and in memory by
/// [`crate::memory::MemoryRendezvous`]. Signaling messages carry no room
/// context: the client publishes to the room it last joined.
pub trait RendezvousClient: Send + Sync {
    /// Asks to join `room`, creating it if it does not exist.
    ///
    /// The outcome arrives as a [`RoomEvent`].
    fn join_or_create(&self, room: RoomId) -> BoxFuture<'_, Result<(), RendezvousError>>;

    /// Relays `message` to the other participant of the joined room.
    fn publish(&self, message: SignalingMessage) -> BoxFuture<'_, Result<(), RendezvousError>>;

    /// Leaves the joined room, if any.
    fn leave(&self) -> BoxFuture<'_, ()>;

    /// Takes the room event receiver. Can only be called once.
    fn take_events(&self) -> Option<mpsc::Receiver<RoomEvent>>;
}
