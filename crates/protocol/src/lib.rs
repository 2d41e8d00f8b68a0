//! Wire types shared by every roomdrop component.
//!
//! - [`signaling`]: messages relayed between the two peers during negotiation.
//! - [`envelope`]: frames exchanged with the rendezvous relay.
//! - [`transfer`]: the metadata control message that opens a file transfer.

pub mod constants;
pub mod envelope;
pub mod signaling;
pub mod transfer;

pub use constants::{CHUNK_SIZE, DATA_CHANNEL_LABEL, MAX_ROOM_PARTICIPANTS};
pub use envelope::{ClientFrame, RoomId, ServerFrame};
pub use signaling::{IceCandidate, SessionDescription, SignalingMessage};
pub use transfer::TransferMetadata;

/// Errors produced while decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid message: {0}")]
    Invalid(String),
}
