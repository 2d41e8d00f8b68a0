//! WebSocket rendezvous for roomdrop.
//!
//! [`RelayServer`] keeps rooms of at most two participants and forwards
//! signaling between them. [`WsRendezvous`] is the client side and
//! implements [`roomdrop_session::RendezvousClient`].

mod client;
mod pumps;
mod rooms;
mod server;

use std::time::Duration;

pub use client::WsRendezvous;
pub use server::{RelayConfig, RelayServer};

/// Largest accepted WebSocket message. Signaling frames are small.
pub const WS_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Interval between keepalive pings.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(30);

/// A connection with no inbound traffic for this long is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// Outbound queue size per connection.
pub(crate) const WS_QUEUE_CAPACITY: usize = 64;

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
}

pub(crate) fn ws_config() -> tokio_tungstenite::tungstenite::protocol::WebSocketConfig {
    let mut config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}
