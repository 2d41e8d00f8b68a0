//! Opaque binary handles for the [`Blob`](crate::DeliveryFlavor::Blob)
//! delivery flavor.

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::ChannelError;

/// Binary message whose bytes are only reachable through [`BlobHandle::bytes`].
#[derive(Debug)]
pub struct BlobHandle {
    size: Option<usize>,
    source: BlobSource,
}

#[derive(Debug)]
enum BlobSource {
    Ready(Bytes),
    Pending(oneshot::Receiver<Bytes>),
}

/// Producer side of a pending blob.
#[derive(Debug)]
pub struct BlobFill {
    tx: oneshot::Sender<Bytes>,
}

impl BlobHandle {
    /// Wraps bytes that are already in memory. Reading still suspends once.
    pub fn deferred(data: Bytes) -> Self {
        Self {
            size: Some(data.len()),
            source: BlobSource::Ready(data),
        }
    }

    /// Creates a handle whose content is supplied later through the
    /// returned [`BlobFill`].
    pub fn pending() -> (Self, BlobFill) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                size: None,
                source: BlobSource::Pending(rx),
            },
            BlobFill { tx },
        )
    }

    /// Size in bytes, when known before extraction.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Extracts the content.
    pub async fn bytes(self) -> Result<Bytes, ChannelError> {
        match self.source {
            BlobSource::Ready(data) => {
                tokio::task::yield_now().await;
                Ok(data)
            }
            BlobSource::Pending(rx) => rx.await.map_err(|_| ChannelError::BlobUnavailable),
        }
    }
}

impl BlobFill {
    /// Supplies the blob content. Ignored if the handle was dropped.
    pub fn complete(self, data: Bytes) {
        let _ = self.tx.send(data);
    }
}
