use std::time::Duration;

use roomdrop_data_channel::DataChannel;
use roomdrop_protocol::TransferMetadata;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::chunked::{ChunkPlan, ChunkSource, checksum_source};
use crate::{CHUNK_SIZE, TransferError};

/// How the sender yields between two chunks.
///
/// No acknowledgement flows back from the receiver, so this is the only
/// knob on the sending rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pacing {
    /// Yield to the scheduler before each chunk.
    #[default]
    Yield,
    /// Sleep for a fixed delay before each chunk.
    Interval(Duration),
}

impl Pacing {
    async fn tick(self) {
        match self {
            Self::Yield => tokio::task::yield_now().await,
            Self::Interval(delay) => tokio::time::sleep(delay).await,
        }
    }
}

/// Sender configuration.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Chunk size in bytes. 0 means [`CHUNK_SIZE`], and larger values are
    /// capped at it since receivers reject bigger chunks.
    pub chunk_size: usize,
    pub pacing: Pacing,
    /// Compute a SHA-256 of the payload and announce it in the metadata.
    pub checksum: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            pacing: Pacing::default(),
            checksum: true,
        }
    }
}

impl SenderConfig {
    fn effective_chunk_size(&self) -> usize {
        match self.chunk_size {
            0 => CHUNK_SIZE,
            n => n.min(CHUNK_SIZE),
        }
    }
}

/// Summary of a finished send.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_sent: u64,
    pub chunks_sent: u64,
}

/// Handle on a spawned send.
pub struct SendHandle {
    join: JoinHandle<Result<SendReport, TransferError>>,
    cancel: CancellationToken,
}

impl SendHandle {
    /// Stops the send before its next chunk.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the send to finish.
    pub async fn wait(self) -> Result<SendReport, TransferError> {
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Cancelled),
        }
    }
}

/// Streams one payload over a data channel as metadata plus chunks.
pub struct ChunkSender {
    channel: DataChannel,
    config: SenderConfig,
}

impl ChunkSender {
    pub fn new(channel: DataChannel, config: SenderConfig) -> Self {
        Self { channel, config }
    }

    /// Starts sending `source` in a background task and returns immediately.
    pub fn send<S>(&self, source: S, name: Option<String>) -> SendHandle
    where
        S: ChunkSource + 'static,
    {
        let cancel = CancellationToken::new();
        let channel = self.channel.clone();
        let config = self.config.clone();
        let task_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            send_payload(&channel, &config, source, name, &task_cancel).await
        });
        SendHandle { join, cancel }
    }
}

async fn send_payload<S: ChunkSource>(
    channel: &DataChannel,
    config: &SenderConfig,
    mut source: S,
    name: Option<String>,
    cancel: &CancellationToken,
) -> Result<SendReport, TransferError> {
    let chunk_size = config.effective_chunk_size();
    let size = source.size();

    let mut metadata = TransferMetadata::new(name, size);
    if config.checksum {
        metadata = metadata.with_checksum(checksum_source(&mut source, chunk_size).await?);
    }
    channel.send_text(metadata.to_json()?).await?;

    let plan = ChunkPlan::new(size, chunk_size);
    info!(
        name = ?metadata.name,
        size,
        chunks = metadata.chunk_count(chunk_size),
        "sending file"
    );

    let mut report = SendReport::default();
    for span in plan {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(sent = report.bytes_sent, size, "send cancelled");
                return Err(TransferError::Cancelled);
            }
            _ = config.pacing.tick() => {}
        }

        let data = source.read_chunk(span).await?;
        if data.len() != span.len {
            return Err(TransferError::ShortRead {
                offset: span.offset,
                expected: span.len,
                actual: data.len(),
            });
        }
        channel.send_binary(data).await?;

        report.chunks_sent += 1;
        report.bytes_sent = span.end();
        trace!(offset = span.offset, len = span.len, "chunk sent");
    }

    info!(
        bytes = report.bytes_sent,
        chunks = report.chunks_sent,
        "file sent"
    );
    Ok(report)
}
