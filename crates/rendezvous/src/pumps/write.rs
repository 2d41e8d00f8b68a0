//! WebSocket write pump.

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Writes queued messages to the WebSocket, then a close frame.
///
/// On cancellation, messages already queued are flushed first.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(m) = write_rx.try_recv() {
                    if let Err(e) = write.send(m).await {
                        debug!("WebSocket write error while closing: {e}");
                        return;
                    }
                }
                break;
            }
            msg = write_rx.recv() => {
                match msg {
                    Some(tungstenite::Message::Close(frame)) => {
                        let _ = write.send(tungstenite::Message::Close(frame)).await;
                        return;
                    }
                    Some(m) => {
                        if let Err(e) = write.send(m).await {
                            error!("WebSocket write error: {e}");
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    let _ = write.send(tungstenite::Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    fn capture() -> (
        impl SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
        mpsc::Receiver<tungstenite::Message>,
    ) {
        let (tx, rx) = mpsc::channel::<tungstenite::Message>(16);
        let sink = sink::unfold(tx, |tx, msg: tungstenite::Message| async move {
            let _ = tx.send(msg).await;
            Ok::<_, tungstenite::Error>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[tokio::test]
    async fn queued_messages_are_flushed_on_cancel() {
        let (sink, mut out) = capture();
        let (write_tx, write_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        write_tx
            .send(tungstenite::Message::Text("leave".into()))
            .await
            .unwrap();
        cancel.cancel();
        write_pump(sink, write_rx, cancel).await;

        let mut seen = Vec::new();
        while let Ok(m) = out.try_recv() {
            seen.push(m);
        }
        assert!(seen.iter().any(|m| matches!(m, tungstenite::Message::Text(t) if t.as_str() == "leave")));
        assert!(matches!(seen.last(), Some(tungstenite::Message::Close(None))));
    }

    #[tokio::test]
    async fn stops_when_senders_are_gone() {
        let (sink, mut out) = capture();
        let (write_tx, write_rx) = mpsc::channel(16);
        drop(write_tx);

        write_pump(sink, write_rx, CancellationToken::new()).await;
        assert!(matches!(out.recv().await, Some(tungstenite::Message::Close(None))));
    }
}
