//! Error types for negotiation and the session surface.

use std::time::Duration;

use roomdrop_data_channel::ChannelError;
use roomdrop_protocol::ProtocolError;
use roomdrop_transfer::TransferError;

/// Errors reported by a rendezvous transport.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    #[error("not joined to a room")]
    NotJoined,

    #[error("rendezvous connection closed")]
    Closed,

    #[error("rendezvous transport error: {0}")]
    Transport(String),

    #[error("rendezvous protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Reasons a negotiation can fail.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("peer connection error: {0}")]
    Connection(String),

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("no remote offer applied")]
    NoRemoteOffer,

    #[error("no local data channel created")]
    NoDataChannel,

    #[error("room is full")]
    RoomFull,

    #[error("peer left the room")]
    PeerLeft,

    #[error("negotiation timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by [`SessionHandle`](crate::SessionHandle) calls.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("session already joined a room")]
    AlreadyJoined,

    #[error("session task has stopped")]
    Stopped,

    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}
