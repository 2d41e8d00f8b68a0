use std::time::Duration;

use bytes::{Bytes, BytesMut};
use roomdrop_data_channel::{ChannelMessage, DataChannel};
use roomdrop_protocol::TransferMetadata;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chunked::checksum_bytes;
use crate::extract::{ByteExtractor, Extractor};
use crate::progress::{ProgressMeter, TransferProgress};
use crate::{CHUNK_SIZE, TransferError};

/// Default upper bound on a single transfer held in memory (1 GiB).
const DEFAULT_MAX_TRANSFER_BYTES: u64 = 1 << 30;

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Largest declared size accepted; larger metadata is rejected.
    pub max_transfer_bytes: u64,
    /// Fail an in-flight transfer when no message arrives for this long.
    pub stall_timeout: Option<Duration>,
    /// Minimum delay between two progress events (`None` = meter default).
    pub progress_interval: Option<Duration>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_transfer_bytes: DEFAULT_MAX_TRANSFER_BYTES,
            stall_timeout: None,
            progress_interval: None,
        }
    }
}

/// A fully reassembled file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Name suggested by the sender, unvalidated.
    pub name: Option<String>,
    pub data: Bytes,
}

/// What the receiver reports while consuming a channel.
#[derive(Debug)]
pub enum TransferEvent {
    Started(TransferMetadata),
    Progress(TransferProgress),
    Completed(ReceivedFile),
    Failed(TransferError),
}

struct ReceiveState {
    metadata: TransferMetadata,
    received: u64,
    buffer: BytesMut,
}

/// Reassembles one transfer at a time from channel messages.
///
/// The first text message of a transfer is its metadata; binary messages
/// that follow are copied at the running offset until the declared size is
/// reached.
pub struct ChunkReceiver<E = Extractor> {
    extractor: E,
    config: ReceiverConfig,
    state: Option<ReceiveState>,
    meter: ProgressMeter,
}

impl ChunkReceiver<Extractor> {
    /// Builds a receiver whose extractor matches the channel's flavor.
    pub fn for_channel(channel: &DataChannel, config: ReceiverConfig) -> Self {
        Self::new(Extractor::for_flavor(channel.flavor()), config)
    }
}

impl<E: ByteExtractor> ChunkReceiver<E> {
    pub fn new(extractor: E, config: ReceiverConfig) -> Self {
        let meter = ProgressMeter::new(config.progress_interval);
        Self {
            extractor,
            config,
            state: None,
            meter,
        }
    }

    /// `true` while no transfer is in flight.
    pub fn is_idle(&self) -> bool {
        self.state.is_none()
    }

    /// Feeds one channel message and returns the resulting events.
    pub async fn handle(&mut self, msg: ChannelMessage) -> Vec<TransferEvent> {
        match msg {
            ChannelMessage::Text(text) => self.handle_metadata(&text),
            other => self.handle_chunk(other).await,
        }
    }

    fn handle_metadata(&mut self, text: &str) -> Vec<TransferEvent> {
        let mut events = Vec::new();

        if let Some(prev) = self.state.take() {
            warn!(
                received = prev.received,
                size = prev.metadata.size,
                "metadata arrived mid-transfer, dropping partial file"
            );
            events.push(TransferEvent::Failed(TransferError::Interrupted {
                received: prev.received,
                size: prev.metadata.size,
            }));
        }
        self.meter.reset();

        let metadata = match TransferMetadata::from_json(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping malformed transfer metadata");
                events.push(TransferEvent::Failed(e.into()));
                return events;
            }
        };

        let too_large = TransferError::TooLarge {
            size: metadata.size,
            max: self.config.max_transfer_bytes,
        };
        if metadata.size > self.config.max_transfer_bytes {
            warn!(size = metadata.size, "rejecting oversized transfer");
            events.push(TransferEvent::Failed(too_large));
            return events;
        }
        let Ok(len) = usize::try_from(metadata.size) else {
            events.push(TransferEvent::Failed(too_large));
            return events;
        };

        info!(
            name = ?metadata.name,
            size = metadata.size,
            chunks = metadata.chunk_count(CHUNK_SIZE),
            "receiving file"
        );
        events.push(TransferEvent::Started(metadata.clone()));

        self.state = Some(ReceiveState {
            metadata,
            received: 0,
            buffer: BytesMut::zeroed(len),
        });

        if len == 0 {
            events.push(self.finish());
        }
        events
    }

    async fn handle_chunk(&mut self, msg: ChannelMessage) -> Vec<TransferEvent> {
        if self.state.is_none() {
            debug!("dropping chunk received before metadata");
            return vec![TransferEvent::Failed(TransferError::UnexpectedChunk)];
        }

        let data = match self.extractor.extract(msg).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "chunk extraction failed, dropping partial file");
                self.state = None;
                return vec![TransferEvent::Failed(e)];
            }
        };

        if data.len() > CHUNK_SIZE {
            warn!(chunk = data.len(), "chunk exceeds the chunk limit, dropping partial file");
            self.state = None;
            return vec![TransferEvent::Failed(TransferError::OversizedChunk {
                len: data.len(),
                max: CHUNK_SIZE,
            })];
        }

        let Some(state) = self.state.as_mut() else {
            return Vec::new();
        };
        let size = state.metadata.size;
        let end = state.received + data.len() as u64;
        if end > size {
            warn!(
                size,
                received = state.received,
                chunk = data.len(),
                "chunk overruns declared size, dropping partial file"
            );
            let err = TransferError::Overrun {
                size,
                received: state.received,
                chunk: data.len(),
            };
            self.state = None;
            return vec![TransferEvent::Failed(err)];
        }

        // `end <= size` and `size` fits in usize, checked on metadata.
        let start = state.received as usize;
        state.buffer[start..end as usize].copy_from_slice(&data);
        state.received = end;

        let mut events = Vec::new();
        if let Some(progress) = self.meter.record(data.len() as u64, end, size) {
            events.push(TransferEvent::Progress(progress));
        }
        if end == size {
            events.push(self.finish());
        }
        events
    }

    fn finish(&mut self) -> TransferEvent {
        self.meter.reset();
        let Some(state) = self.state.take() else {
            return TransferEvent::Failed(TransferError::UnexpectedChunk);
        };

        let data = state.buffer.freeze();
        if let Some(expected) = &state.metadata.checksum {
            if !checksum_bytes(&data).eq_ignore_ascii_case(expected) {
                warn!(name = ?state.metadata.name, "checksum mismatch, dropping file");
                return TransferEvent::Failed(TransferError::ChecksumMismatch);
            }
        }

        info!(name = ?state.metadata.name, size = data.len(), "file received");
        TransferEvent::Completed(ReceivedFile {
            name: state.metadata.name,
            data,
        })
    }

    /// Called when the channel ends. Fails an in-flight transfer.
    pub fn on_channel_closed(&mut self) -> Option<TransferEvent> {
        let state = self.state.take()?;
        warn!(
            received = state.received,
            size = state.metadata.size,
            "channel closed mid-transfer"
        );
        Some(TransferEvent::Failed(TransferError::ChannelClosed {
            received: state.received,
            size: state.metadata.size,
        }))
    }

    /// Called when the stall timeout expires. Fails an in-flight transfer.
    pub fn on_stall(&mut self, waited: Duration) -> Option<TransferEvent> {
        let state = self.state.take()?;
        warn!(
            received = state.received,
            size = state.metadata.size,
            ?waited,
            "transfer stalled"
        );
        self.meter.reset();
        Some(TransferEvent::Failed(TransferError::Stalled(waited)))
    }

    /// Consumes `messages` until the channel ends, forwarding events.
    ///
    /// Returns early if the event receiver is dropped.
    pub async fn run(
        mut self,
        mut messages: mpsc::Receiver<ChannelMessage>,
        events: mpsc::Sender<TransferEvent>,
    ) {
        loop {
            let next = match self.config.stall_timeout {
                Some(limit) if !self.is_idle() => {
                    match tokio::time::timeout(limit, messages.recv()).await {
                        Ok(next) => next,
                        Err(_) => {
                            if let Some(event) = self.on_stall(limit) {
                                if events.send(event).await.is_err() {
                                    return;
                                }
                            }
                            continue;
                        }
                    }
                }
                _ => messages.recv().await,
            };

            let Some(msg) = next else {
                if let Some(event) = self.on_channel_closed() {
                    let _ = events.send(event).await;
                }
                debug!("receiver finished: channel ended");
                return;
            };

            for event in self.handle(msg).await {
                if events.send(event).await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use roomdrop_data_channel::{DeliveryFlavor, memory};

    use super::*;
    use crate::extract::BufferExtractor;
    use crate::sender::{ChunkSender, SenderConfig};

    fn receiver() -> ChunkReceiver<BufferExtractor> {
        ChunkReceiver::new(BufferExtractor, ReceiverConfig::default())
    }

    fn meta(size: u64) -> ChannelMessage {
        ChannelMessage::Text(TransferMetadata::new(Some("f.bin".into()), size).to_json().unwrap())
    }

    fn chunk(data: &'static [u8]) -> ChannelMessage {
        ChannelMessage::Binary(Bytes::from_static(data))
    }

    fn completed(events: &[TransferEvent]) -> Vec<&ReceivedFile> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Completed(f) => Some(f),
                _ => None,
            })
            .collect()
    }

    async fn drain(rx: &mut mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut out = Vec::new();
        while let Some(e) = rx.recv().await {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn completes_exactly_at_declared_size() {
        let mut rx = receiver();
        assert!(matches!(rx.handle(meta(6)).await[..], [TransferEvent::Started(_)]));

        let events = rx.handle(chunk(b"abc")).await;
        assert!(completed(&events).is_empty());
        assert!(!rx.is_idle());

        let events = rx.handle(chunk(b"def")).await;
        let files = completed(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data, Bytes::from_static(b"abcdef"));
        assert_eq!(files[0].name.as_deref(), Some("f.bin"));
        assert!(rx.is_idle());
    }

    #[tokio::test]
    async fn empty_file_completes_on_metadata() {
        let mut rx = receiver();
        let events = rx.handle(meta(0)).await;
        assert!(matches!(events[0], TransferEvent::Started(_)));
        let files = completed(&events);
        assert_eq!(files.len(), 1);
        assert!(files[0].data.is_empty());
        assert!(rx.is_idle());
    }

    #[tokio::test]
    async fn chunk_before_metadata_is_rejected() {
        let mut rx = receiver();
        let events = rx.handle(chunk(b"stray")).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::UnexpectedChunk)]
        ));
        assert!(rx.is_idle());
    }

    #[tokio::test]
    async fn overrun_is_rejected_and_resets() {
        let mut rx = receiver();
        rx.handle(meta(4)).await;
        rx.handle(chunk(b"ab")).await;

        let events = rx.handle(chunk(b"cde")).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::Overrun {
                size: 4,
                received: 2,
                chunk: 3
            })]
        ));
        assert!(rx.is_idle());

        // A fresh transfer works afterwards.
        rx.handle(meta(2)).await;
        assert_eq!(completed(&rx.handle(chunk(b"ok")).await).len(), 1);
    }

    #[tokio::test]
    async fn chunk_above_limit_is_rejected_and_resets() {
        let mut rx = receiver();
        rx.handle(meta(CHUNK_SIZE as u64 * 4)).await;

        let big = ChannelMessage::Binary(Bytes::from(vec![1u8; CHUNK_SIZE + 1]));
        let events = rx.handle(big).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::OversizedChunk { len, max })]
                if len == CHUNK_SIZE + 1 && max == CHUNK_SIZE
        ));
        assert!(rx.is_idle());

        rx.handle(meta(2)).await;
        assert_eq!(completed(&rx.handle(chunk(b"ok")).await).len(), 1);
    }

    #[tokio::test]
    async fn new_metadata_interrupts_transfer() {
        let mut rx = receiver();
        rx.handle(meta(10)).await;
        rx.handle(chunk(b"1234")).await;

        let events = rx.handle(meta(3)).await;
        assert!(matches!(
            events[0],
            TransferEvent::Failed(TransferError::Interrupted {
                received: 4,
                size: 10
            })
        ));
        assert!(matches!(events[1], TransferEvent::Started(ref m) if m.size == 3));

        let files = completed(&rx.handle(chunk(b"xyz")).await)
            .into_iter()
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(files[0].data, Bytes::from_static(b"xyz"));
    }

    #[tokio::test]
    async fn malformed_metadata_is_reported() {
        let mut rx = receiver();
        let events = rx.handle(ChannelMessage::Text("not json".into())).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::Metadata(_))]
        ));
        assert!(rx.is_idle());
    }

    #[tokio::test]
    async fn oversized_transfer_is_rejected() {
        let config = ReceiverConfig {
            max_transfer_bytes: 8,
            ..ReceiverConfig::default()
        };
        let mut rx = ChunkReceiver::new(BufferExtractor, config);
        let events = rx.handle(meta(9)).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::TooLarge { size: 9, max: 8 })]
        ));
        assert!(rx.is_idle());
    }

    #[tokio::test]
    async fn checksum_mismatch_fails() {
        let mut rx = receiver();
        let wrong = TransferMetadata::new(None, 3).with_checksum(checksum_bytes(b"abd"));
        rx.handle(ChannelMessage::Text(wrong.to_json().unwrap())).await;

        let events = rx.handle(chunk(b"abc")).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, TransferEvent::Failed(TransferError::ChecksumMismatch))));
        assert!(completed(&events).is_empty());
    }

    #[tokio::test]
    async fn buffer_receiver_rejects_blob_payload() {
        let mut rx = receiver();
        rx.handle(meta(1)).await;
        let blob = roomdrop_data_channel::BlobHandle::deferred(Bytes::from_static(b"x"));
        let events = rx.handle(ChannelMessage::Blob(blob)).await;
        assert!(matches!(
            events[..],
            [TransferEvent::Failed(TransferError::UnexpectedPayload { .. })]
        ));
    }

    #[tokio::test]
    async fn close_mid_transfer_fails() {
        let mut rx = receiver();
        assert!(rx.on_channel_closed().is_none());

        rx.handle(meta(10)).await;
        rx.handle(chunk(b"12")).await;
        assert!(matches!(
            rx.on_channel_closed(),
            Some(TransferEvent::Failed(TransferError::ChannelClosed {
                received: 2,
                size: 10
            }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn stall_timeout_fails_transfer() {
        let config = ReceiverConfig {
            stall_timeout: Some(Duration::from_secs(5)),
            ..ReceiverConfig::default()
        };
        let rx = ChunkReceiver::new(BufferExtractor, config);
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (ev_tx, mut ev_rx) = mpsc::channel(8);
        tokio::spawn(rx.run(msg_rx, ev_tx));

        msg_tx.send(meta(10)).await.unwrap();
        msg_tx.send(chunk(b"1234")).await.unwrap();

        assert!(matches!(ev_rx.recv().await, Some(TransferEvent::Started(_))));
        assert!(matches!(ev_rx.recv().await, Some(TransferEvent::Progress(_))));
        assert!(matches!(
            ev_rx.recv().await,
            Some(TransferEvent::Failed(TransferError::Stalled(_)))
        ));
        drop(msg_tx);
        assert!(ev_rx.recv().await.is_none());
    }

    async fn round_trip(flavor: DeliveryFlavor, payload: Bytes) -> Vec<TransferEvent> {
        let (a, b) = memory::pair("files", flavor);
        let rx = ChunkReceiver::for_channel(&b, ReceiverConfig::default());
        let messages = b.take_messages().unwrap();
        let (ev_tx, mut ev_rx) = mpsc::channel(64);
        let task = tokio::spawn(rx.run(messages, ev_tx));

        ChunkSender::new(a, SenderConfig::default())
            .send(payload, Some("small.bin".into()))
            .wait()
            .await
            .unwrap();

        let events = drain(&mut ev_rx).await;
        task.await.unwrap();
        events
    }

    #[tokio::test]
    async fn twenty_thousand_bytes_buffer_flavor() {
        let mut data = vec![0u8; 20_000];
        data[19_999] = 0xAB;
        let events = round_trip(DeliveryFlavor::Buffer, Bytes::from(data.clone())).await;

        let files = completed(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data.len(), 20_000);
        assert_eq!(files[0].data[19_999], 0xAB);
        assert_eq!(&files[0].data[..], &data[..]);
        assert!(!events.iter().any(|e| matches!(e, TransferEvent::Failed(_))));
    }

    #[tokio::test]
    async fn multi_chunk_blob_flavor() {
        let data: Vec<u8> = (0..CHUNK_SIZE * 4 + 17).map(|i| (i % 251) as u8).collect();
        let events = round_trip(DeliveryFlavor::Blob, Bytes::from(data.clone())).await;

        let files = completed(&events);
        assert_eq!(files.len(), 1);
        assert_eq!(&files[0].data[..], &data[..]);
    }

    #[tokio::test]
    async fn empty_file_round_trip() {
        let events = round_trip(DeliveryFlavor::Buffer, Bytes::new()).await;
        let files = completed(&events);
        assert_eq!(files.len(), 1);
        assert!(files[0].data.is_empty());
    }
}
