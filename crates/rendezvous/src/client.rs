//! WebSocket client for the rendezvous relay.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use roomdrop_protocol::{ClientFrame, RoomId, ServerFrame, SignalingMessage};
use roomdrop_session::{BoxFuture, RendezvousClient, RendezvousError, RoomEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::pumps::{ping::ping_pump, write::write_pump};
use crate::{WS_PING_PERIOD, WS_PONG_WAIT, WS_QUEUE_CAPACITY, ws_config};

/// Capacity of the room event queue.
const ROOM_EVENT_CAPACITY: usize = 64;

type CurrentRoom = Arc<Mutex<Option<RoomId>>>;

fn current(room: &CurrentRoom) -> Option<RoomId> {
    room.lock().ok().and_then(|guard| guard.clone())
}

fn set_current(room: &CurrentRoom, value: Option<RoomId>) -> Option<RoomId> {
    match room.lock() {
        Ok(mut guard) => std::mem::replace(&mut *guard, value),
        Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), value),
    }
}

/// Connection to a [`RelayServer`](crate::RelayServer).
///
/// Room frames for rooms other than the one last joined are dropped.
pub struct WsRendezvous {
    write_tx: mpsc::Sender<tungstenite::Message>,
    events_rx: Mutex<Option<mpsc::Receiver<RoomEvent>>>,
    room: CurrentRoom,
    cancel: CancellationToken,
    read_handle: JoinHandle<()>,
    // Not aborted on drop so that queued frames still reach the relay.
    _write_handle: JoinHandle<()>,
    ping_handle: JoinHandle<()>,
}

impl WsRendezvous {
    /// Connects to the relay at `url` (`ws://host:port`).
    pub async fn connect(url: &str) -> Result<Self, RendezvousError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async_with_config(url, Some(ws_config()), false)
            .await
            .map_err(|e| RendezvousError::Transport(e.to_string()))?;
        info!(%url, "connected to rendezvous relay");
        let (write, read) = ws_stream.split();

        let (write_tx, write_rx) = mpsc::channel(WS_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(ROOM_EVENT_CAPACITY);
        let room: CurrentRoom = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let write_handle = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let read_handle = tokio::spawn(read_pump(
            read,
            events_tx,
            room.clone(),
            write_tx.clone(),
            cancel.clone(),
        ));
        let ping_handle = tokio::spawn(ping_pump(write_tx.clone(), WS_PING_PERIOD, cancel.clone()));

        Ok(Self {
            write_tx,
            events_rx: Mutex::new(Some(events_rx)),
            room,
            cancel,
            read_handle,
            _write_handle: write_handle,
            ping_handle,
        })
    }

    /// Closes the connection after flushing queued frames.
    pub async fn close(&self) {
        let _ = self.write_tx.send(tungstenite::Message::Close(None)).await;
        self.cancel.cancel();
    }

    async fn send(&self, frame: &ClientFrame) -> Result<(), RendezvousError> {
        let json = serde_json::to_string(frame).map_err(|e| RendezvousError::Transport(e.to_string()))?;
        self.write_tx
            .send(tungstenite::Message::Text(json.into()))
            .await
            .map_err(|_| RendezvousError::Closed)
    }
}

impl RendezvousClient for WsRendezvous {
    fn join_or_create(&self, room: RoomId) -> BoxFuture<'_, Result<(), RendezvousError>> {
        Box::pin(async move {
            set_current(&self.room, Some(room.clone()));
            self.send(&ClientFrame::CreateOrJoin { room }).await
        })
    }

    fn publish(&self, message: SignalingMessage) -> BoxFuture<'_, Result<(), RendezvousError>> {
        Box::pin(async move {
            let room = current(&self.room).ok_or(RendezvousError::NotJoined)?;
            self.send(&ClientFrame::Publish { room, payload: message }).await
        })
    }

    fn leave(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(room) = set_current(&self.room, None) {
                if let Err(e) = self.send(&ClientFrame::Leave { room }).await {
                    debug!("could not send leave: {e}");
                }
            }
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RoomEvent>> {
        self.events_rx.lock().ok().and_then(|mut guard| guard.take())
    }
}

impl Drop for WsRendezvous {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.read_handle.abort();
        self.ping_handle.abort();
    }
}

/// Maps a relay frame to a room event for `room`.
fn room_event(frame: ServerFrame, room: Option<&RoomId>) -> Option<RoomEvent> {
    if let Some(frame_room) = frame.room() {
        if Some(frame_room) != room {
            trace!(room = %frame_room, "frame for another room, dropping");
            return None;
        }
    }
    match frame {
        ServerFrame::Created { peer_id, .. } => Some(RoomEvent::Created { peer_id }),
        ServerFrame::Joined { peer_id, .. } => Some(RoomEvent::Joined { peer_id }),
        ServerFrame::Ready { .. } => Some(RoomEvent::Ready),
        ServerFrame::Full { .. } => Some(RoomEvent::Full),
        ServerFrame::Message { payload, .. } => Some(RoomEvent::Message(payload)),
        ServerFrame::PeerLeft { .. } => Some(RoomEvent::PeerLeft),
        ServerFrame::Error { message } => {
            warn!(%message, "relay reported an error");
            None
        }
    }
}

/// Reads relay frames and turns them into room events.
///
/// Ends with [`RoomEvent::Disconnected`] unless cancelled.
async fn read_pump<S>(
    mut read: S,
    events_tx: mpsc::Sender<RoomEvent>,
    room: CurrentRoom,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            () = &mut deadline => {
                warn!("no traffic from relay within {WS_PONG_WAIT:?}, closing");
                break;
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {e}");
                        break;
                    }
                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match msg {
                    tungstenite::Message::Text(text) => {
                        let frame: ServerFrame = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("malformed relay frame: {e}");
                                continue;
                            }
                        };
                        if let Some(event) = room_event(frame, current(&room).as_ref()) {
                            if events_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.send(tungstenite::Message::Pong(data)).await;
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("relay closed the connection");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    let _ = events_tx.send(RoomEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use roomdrop_protocol::SessionDescription;

    fn text(frame: &ServerFrame) -> Result<tungstenite::Message, tungstenite::Error> {
        Ok(tungstenite::Message::Text(serde_json::to_string(frame).unwrap().into()))
    }

    #[test]
    fn frames_map_to_room_events() {
        let room = RoomId::new("r");
        let here = Some(&room);
        assert_eq!(
            room_event(
                ServerFrame::Created {
                    room: room.clone(),
                    peer_id: "p".into()
                },
                here
            ),
            Some(RoomEvent::Created { peer_id: "p".into() })
        );
        assert_eq!(
            room_event(ServerFrame::Ready { room: room.clone() }, here),
            Some(RoomEvent::Ready)
        );
        assert_eq!(
            room_event(ServerFrame::PeerLeft { room: room.clone() }, here),
            Some(RoomEvent::PeerLeft)
        );
        assert_eq!(
            room_event(
                ServerFrame::Message {
                    room: room.clone(),
                    payload: SignalingMessage::Offer(SessionDescription::new("o"))
                },
                here
            ),
            Some(RoomEvent::Message(SignalingMessage::Offer(SessionDescription::new("o"))))
        );
        assert_eq!(
            room_event(
                ServerFrame::Error {
                    message: "nope".into()
                },
                here
            ),
            None
        );
    }

    #[test]
    fn frames_for_other_rooms_are_dropped() {
        let room = RoomId::new("r");
        assert_eq!(
            room_event(ServerFrame::Ready { room: RoomId::new("other") }, Some(&room)),
            None
        );
        assert_eq!(room_event(ServerFrame::Ready { room }, None), None);
    }

    #[tokio::test]
    async fn read_pump_reports_disconnect_at_stream_end() {
        let room: CurrentRoom = Arc::new(Mutex::new(Some(RoomId::new("r"))));
        let frames = stream::iter(vec![
            text(&ServerFrame::Full { room: RoomId::new("r") }),
            Ok(tungstenite::Message::Text("garbage".into())),
        ]);
        let (events_tx, mut events_rx) = mpsc::channel(8);
        let (write_tx, _write_rx) = mpsc::channel(8);

        read_pump(frames, events_tx, room, write_tx, CancellationToken::new()).await;

        assert_eq!(events_rx.recv().await, Some(RoomEvent::Full));
        assert_eq!(events_rx.recv().await, Some(RoomEvent::Disconnected));
        assert_eq!(events_rx.recv().await, None);
    }

    #[tokio::test]
    async fn read_pump_answers_pings() {
        let room: CurrentRoom = Arc::new(Mutex::new(None));
        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(vec![1u8].into()))]);
        let (events_tx, _events_rx) = mpsc::channel(8);
        let (write_tx, mut write_rx) = mpsc::channel(8);

        read_pump(frames, events_tx, room, write_tx, CancellationToken::new()).await;
        assert!(matches!(write_rx.recv().await, Some(tungstenite::Message::Pong(_))));
    }
}
