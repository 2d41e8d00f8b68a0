//! Byte extraction per delivery flavor.
//!
//! The receiver never inspects payload types ad hoc: one extractor is
//! chosen from the channel's [`DeliveryFlavor`] when the receiver is built.

use std::future::Future;

use bytes::Bytes;
use roomdrop_data_channel::{ChannelMessage, DeliveryFlavor};

use crate::TransferError;

/// Turns a binary channel message into its bytes.
pub trait ByteExtractor: Send + Sync {
    fn extract(
        &self,
        msg: ChannelMessage,
    ) -> impl Future<Output = Result<Bytes, TransferError>> + Send;
}

/// Flavor A: payloads arrive as directly addressable buffers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferExtractor;

/// Flavor B: payloads arrive as blob handles read asynchronously.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlobExtractor;

impl ByteExtractor for BufferExtractor {
    async fn extract(&self, msg: ChannelMessage) -> Result<Bytes, TransferError> {
        match msg {
            ChannelMessage::Binary(data) => Ok(data),
            _ => Err(TransferError::UnexpectedPayload { expected: "buffer" }),
        }
    }
}

impl ByteExtractor for BlobExtractor {
    async fn extract(&self, msg: ChannelMessage) -> Result<Bytes, TransferError> {
        match msg {
            ChannelMessage::Blob(blob) => Ok(blob.bytes().await?),
            _ => Err(TransferError::UnexpectedPayload { expected: "blob" }),
        }
    }
}

/// Extractor selected once from a channel's flavor.
#[derive(Debug, Clone, Copy)]
pub enum Extractor {
    Buffer(BufferExtractor),
    Blob(BlobExtractor),
}

impl Extractor {
    pub fn for_flavor(flavor: DeliveryFlavor) -> Self {
        match flavor {
            DeliveryFlavor::Buffer => Self::Buffer(BufferExtractor),
            DeliveryFlavor::Blob => Self::Blob(BlobExtractor),
        }
    }
}

impl ByteExtractor for Extractor {
    async fn extract(&self, msg: ChannelMessage) -> Result<Bytes, TransferError> {
        match self {
            Self::Buffer(e) => e.extract(msg).await,
            Self::Blob(e) => e.extract(msg).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use roomdrop_data_channel::BlobHandle;

    use super::*;

    #[tokio::test]
    async fn buffer_extractor_passes_bytes_through() {
        let data = Bytes::from_static(b"chunk");
        let out = BufferExtractor
            .extract(ChannelMessage::Binary(data.clone()))
            .await
            .unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn buffer_extractor_rejects_blobs() {
        let blob = BlobHandle::deferred(Bytes::from_static(b"x"));
        let result = BufferExtractor.extract(ChannelMessage::Blob(blob)).await;
        assert!(matches!(
            result,
            Err(TransferError::UnexpectedPayload { expected: "buffer" })
        ));
    }

    #[tokio::test]
    async fn blob_extractor_reads_pending_blob() {
        let (blob, fill) = BlobHandle::pending();
        fill.complete(Bytes::from_static(b"late"));
        let out = BlobExtractor
            .extract(ChannelMessage::Blob(blob))
            .await
            .unwrap();
        assert_eq!(out, Bytes::from_static(b"late"));
    }

    #[tokio::test]
    async fn blob_extractor_surfaces_missing_content() {
        let (blob, fill) = BlobHandle::pending();
        drop(fill);
        let result = BlobExtractor.extract(ChannelMessage::Blob(blob)).await;
        assert!(matches!(result, Err(TransferError::Channel(_))));
    }

    #[test]
    fn selection_follows_flavor() {
        assert!(matches!(
            Extractor::for_flavor(DeliveryFlavor::Buffer),
            Extractor::Buffer(_)
        ));
        assert!(matches!(
            Extractor::for_flavor(DeliveryFlavor::Blob),
            Extractor::Blob(_)
        ));
    }
}
