//! Error types for the data channel.

/// Errors produced by a data channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel is not open")]
    NotOpen,

    #[error("channel closed")]
    Closed,

    #[error("blob content was never delivered")]
    BlobUnavailable,

    #[error("protocol error: {0}")]
    Protocol(String),
}
