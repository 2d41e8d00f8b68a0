//! Chunked single-file transfer over a data channel.
//!
//! The sender emits one [`TransferMetadata`] text message followed by the
//! file content as binary chunks of at most [`CHUNK_SIZE`] bytes, in offset
//! order. The receiver reassembles the chunks at their implicit offsets and
//! reports completion once the declared size is reached. Chunks carry no
//! sequence number: the channel's ordering is relied upon, never repaired.

mod chunked;
mod extract;
mod progress;
mod receiver;
mod sender;
mod validation;

use std::time::Duration;

pub use chunked::{ChunkPlan, ChunkSource, ChunkSpan, FileSource, checksum_bytes, checksum_source};
pub use extract::{BlobExtractor, BufferExtractor, ByteExtractor, Extractor};
pub use progress::{ProgressMeter, TransferProgress};
pub use receiver::{ChunkReceiver, ReceivedFile, ReceiverConfig, TransferEvent};
pub use roomdrop_protocol::{CHUNK_SIZE, TransferMetadata};
pub use sender::{ChunkSender, Pacing, SendHandle, SendReport, SenderConfig};
pub use validation::{FALLBACK_FILE_NAME, safe_file_name, validate_file_name};

use roomdrop_data_channel::ChannelError;
use roomdrop_protocol::ProtocolError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("invalid metadata: {0}")]
    Metadata(#[from] ProtocolError),

    #[error("chunk received before transfer metadata")]
    UnexpectedChunk,

    #[error("unexpected payload on a {expected} channel")]
    UnexpectedPayload { expected: &'static str },

    #[error("chunk of {chunk} bytes overruns declared size {size} (received {received})")]
    Overrun { size: u64, received: u64, chunk: usize },

    #[error("chunk of {len} bytes exceeds the {max}-byte chunk limit")]
    OversizedChunk { len: usize, max: usize },

    #[error("transfer interrupted by new metadata after {received} of {size} bytes")]
    Interrupted { received: u64, size: u64 },

    #[error("declared size {size} exceeds limit {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("no data for {0:?}, transfer stalled")]
    Stalled(Duration),

    #[error("channel closed after {received} of {size} bytes")]
    ChannelClosed { received: u64, size: u64 },

    #[error("short read at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid file name: {0}")]
    InvalidName(String),
}
