//! Byte-stream transport: read and write pumps over the [`wire`](crate::wire) format.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::wire::{Frame, read_frame, write_frame};
use crate::{ChannelLink, ChannelMessage, ChannelState, DeliveryFlavor};

/// Stream buffer size (64 KB).
const STREAM_BUFFER_SIZE: usize = 64 * 1024;

impl ChannelLink {
    /// Attaches the link to a connected byte stream and opens the channel.
    ///
    /// Spawns one read pump and one write pump. When either ends, the
    /// channel moves to [`ChannelState::Closed`].
    pub fn attach_stream<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let ChannelLink {
            label,
            flavor,
            write_rx,
            messages_tx,
            state_tx,
            cancel,
        } = self;

        let (reader, writer) = tokio::io::split(stream);
        let reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, reader);
        let writer = BufWriter::with_capacity(STREAM_BUFFER_SIZE, writer);

        if cancel.is_cancelled() {
            state_tx.send_replace(ChannelState::Closed);
            return;
        }

        state_tx.send_replace(ChannelState::Open);
        info!(%label, ?flavor, "data channel open");

        tokio::spawn(write_pump(writer, write_rx, cancel.clone()));
        tokio::spawn(read_pump(reader, messages_tx, flavor, state_tx, cancel, label));
    }
}

/// Writes queued frames to the stream, flushing once the queue drains.
///
/// On cancellation the frames still queued are written before shutdown.
async fn write_pump<W>(mut writer: W, mut write_rx: mpsc::Receiver<Frame>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Frames queued before the close still go out.
                while let Ok(frame) = write_rx.try_recv() {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        debug!("data channel write error while closing: {e}");
                        break;
                    }
                }
                break;
            }
            frame = write_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    warn!("data channel write error: {e}");
                    break;
                }
                if write_rx.is_empty() {
                    if let Err(e) = writer.flush().await {
                        warn!("data channel flush error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    cancel.cancel();
}

/// Reads frames from the stream and hands them to the application.
async fn read_pump<R>(
    mut reader: R,
    messages_tx: mpsc::Sender<ChannelMessage>,
    flavor: DeliveryFlavor,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
    label: String,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_frame(&mut reader) => {
                match result {
                    Ok(Some(frame)) => {
                        trace!(len = frame.len(), "data channel frame received");
                        let msg = ChannelMessage::deliver(frame, flavor);
                        if messages_tx.send(msg).await.is_err() {
                            trace!("message receiver dropped, discarding frame");
                        }
                    }
                    Ok(None) => {
                        debug!(%label, "data channel stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(%label, "data channel read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    state_tx.send_replace(ChannelState::Closed);
    info!(%label, "data channel closed");
}
