//! Ordered, reliable, message-oriented channel between two peers.
//!
//! A channel is created as a pair: the [`DataChannel`] handle used by the
//! application and the [`ChannelLink`] consumed by whatever transport
//! carries the messages. The link is attached either to a byte stream
//! ([`ChannelLink::attach_stream`], framed per [`wire`]) or to another link
//! in memory ([`memory::connect`]). Until then the channel stays in
//! [`ChannelState::Connecting`].
//!
//! Incoming binary messages are delivered according to the channel's
//! [`DeliveryFlavor`]: directly as [`Bytes`] or as a [`BlobHandle`] whose
//! content must be extracted asynchronously.

pub mod blob;
pub mod error;
pub mod memory;
mod stream;
pub mod wire;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use blob::BlobHandle;
pub use error::ChannelError;
pub use wire::Frame;

/// Capacity of the outbound and inbound message queues.
pub const MESSAGE_QUEUE_CAPACITY: usize = 256;

/// How the channel hands incoming binary messages to the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryFlavor {
    /// Directly addressable byte buffers.
    #[default]
    Buffer,
    /// Opaque blob handles that need an asynchronous extraction step.
    Blob,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Created, transport not attached yet.
    Connecting,
    /// Messages can flow.
    Open,
    /// Closed by either side or by a transport failure.
    Closed,
}

/// A message received from the remote peer.
#[derive(Debug)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
    Blob(BlobHandle),
}

impl ChannelMessage {
    /// Wraps a received frame according to `flavor`.
    pub(crate) fn deliver(frame: Frame, flavor: DeliveryFlavor) -> Self {
        match (frame, flavor) {
            (Frame::Text(text), _) => Self::Text(text),
            (Frame::Binary(data), DeliveryFlavor::Buffer) => Self::Binary(data),
            (Frame::Binary(data), DeliveryFlavor::Blob) => Self::Blob(BlobHandle::deferred(data)),
        }
    }
}

struct Inner {
    label: String,
    flavor: DeliveryFlavor,
    write_tx: mpsc::Sender<Frame>,
    messages_rx: Mutex<Option<mpsc::Receiver<ChannelMessage>>>,
    state_rx: watch::Receiver<ChannelState>,
    cancel: CancellationToken,
}

/// Application side of a channel. Cheap to clone.
#[derive(Clone)]
pub struct DataChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.inner.label)
            .field("flavor", &self.inner.flavor)
            .field("state", &self.state())
            .finish()
    }
}

/// Transport side of a channel, consumed when the transport is attached.
pub struct ChannelLink {
    pub(crate) label: String,
    pub(crate) flavor: DeliveryFlavor,
    pub(crate) write_rx: mpsc::Receiver<Frame>,
    pub(crate) messages_tx: mpsc::Sender<ChannelMessage>,
    pub(crate) state_tx: watch::Sender<ChannelState>,
    pub(crate) cancel: CancellationToken,
}

impl DataChannel {
    /// Creates a channel in the `Connecting` state and its transport link.
    pub fn new(label: impl Into<String>, flavor: DeliveryFlavor) -> (Self, ChannelLink) {
        let label = label.into();
        let (write_tx, write_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_QUEUE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let cancel = CancellationToken::new();

        let channel = Self {
            inner: Arc::new(Inner {
                label: label.clone(),
                flavor,
                write_tx,
                messages_rx: Mutex::new(Some(messages_rx)),
                state_rx,
                cancel: cancel.clone(),
            }),
        };
        let link = ChannelLink {
            label,
            flavor,
            write_rx,
            messages_tx,
            state_tx,
            cancel,
        };
        (channel, link)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn flavor(&self) -> DeliveryFlavor {
        self.inner.flavor
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_rx.borrow()
    }

    /// Subscribes to open/close notifications.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_rx.clone()
    }

    /// Takes the incoming message receiver. Can only be called once.
    ///
    /// Whoever holds the receiver is the sole consumer of the channel.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<ChannelMessage>> {
        self.inner
            .messages_rx
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
    }

    /// Queues a text message. Delivery order matches call order.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ChannelError> {
        self.send_frame(Frame::Text(text.into())).await
    }

    /// Queues a binary message. Delivery order matches call order.
    pub async fn send_binary(&self, data: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.send_frame(Frame::Binary(data.into())).await
    }

    async fn send_frame(&self, frame: Frame) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Open => {}
            ChannelState::Connecting => return Err(ChannelError::NotOpen),
            ChannelState::Closed => return Err(ChannelError::Closed),
        }
        self.inner
            .write_tx
            .send(frame)
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Waits until the channel is open. Fails if it closes first.
    pub async fn opened(&self) -> Result<(), ChannelError> {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| ChannelError::Closed)?;
        match *state {
            ChannelState::Open => Ok(()),
            _ => Err(ChannelError::Closed),
        }
    }

    /// Waits until the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.watch_state();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Closes the channel. Messages already queued are still delivered.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }
}

impl ChannelLink {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn flavor(&self) -> DeliveryFlavor {
        self.flavor
    }

    /// Marks the link closed without ever attaching a transport.
    pub fn abandon(self) {
        self.state_tx.send_replace(ChannelState::Closed);
        self.cancel.cancel();
    }
}
