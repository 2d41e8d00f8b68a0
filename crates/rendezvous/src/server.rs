//! Rendezvous relay server.
//!
//! Accepts WebSocket connections, assigns each a peer id, and applies the
//! room rules from [`Rooms`]. A connection that drops leaves every room it
//! joined, and the remaining participant is told with `peerLeft`.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use roomdrop_protocol::{ClientFrame, RoomId, ServerFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::{accept_async_with_config, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::pumps::write::write_pump;
use crate::rooms::{Delivery, Outbox, Rooms};
use crate::{RelayError, WS_PONG_WAIT, WS_QUEUE_CAPACITY, ws_config};

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on (port 0 = OS-assigned).
    pub bind_addr: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8787).into(),
        }
    }
}

/// The rendezvous relay.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Mutex<Rooms>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            rooms: Mutex::new(Rooms::default()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// The bound address. Only available once [`run`](Self::run) has bound.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Number of participants in `room`.
    pub async fn occupancy(&self, room: &RoomId) -> usize {
        self.rooms.lock().await.occupancy(room)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(self: &Arc<Self>) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener until shutdown.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        info!("rendezvous relay listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("relay shutting down");
                    break Ok(());
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(self);
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                debug!(%peer_addr, "connection ended with error: {e}");
                            }
                        });
                    }
                    Err(e) => error!("accept error: {e}"),
                }
            }
        }
    }

    async fn handle_connection(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), RelayError> {
        let ws_stream = accept_async_with_config(stream, Some(ws_config())).await?;
        let (write, mut read) = ws_stream.split();

        let peer_id = uuid::Uuid::new_v4().to_string();
        info!(%peer_addr, %peer_id, "peer connected");

        let cancel = self.cancel.child_token();
        let (outbox, write_rx) = mpsc::channel(WS_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_pump(write, write_rx, cancel.clone()));
        let mut joined: HashSet<RoomId> = HashSet::new();

        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = tokio::time::timeout(WS_PONG_WAIT, read.next()) => msg,
            };
            let msg = match msg {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(e))) => {
                    debug!(%peer_id, "read error: {e}");
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(%peer_id, "no traffic within {WS_PONG_WAIT:?}, dropping peer");
                    break;
                }
            };

            match msg {
                tungstenite::Message::Text(text) => {
                    self.handle_frame(text.as_str(), &peer_id, &outbox, &mut joined).await;
                }
                tungstenite::Message::Ping(data) => {
                    let _ = outbox.send(tungstenite::Message::Pong(data)).await;
                }
                tungstenite::Message::Close(_) => break,
                _ => {}
            }
        }

        for room in joined {
            let deliveries = self.rooms.lock().await.leave(&room, &peer_id);
            deliver(deliveries).await;
        }
        info!(%peer_addr, %peer_id, "peer disconnected");

        cancel.cancel();
        drop(outbox);
        let _ = writer.await;
        Ok(())
    }

    async fn handle_frame(&self, text: &str, peer_id: &str, outbox: &Outbox, joined: &mut HashSet<RoomId>) {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer_id, "malformed frame: {e}");
                deliver(vec![(
                    outbox.clone(),
                    ServerFrame::Error {
                        message: format!("malformed frame: {e}"),
                    },
                )])
                .await;
                return;
            }
        };

        let deliveries = {
            let mut rooms = self.rooms.lock().await;
            match frame {
                ClientFrame::CreateOrJoin { room } => {
                    let deliveries = rooms.join(room.clone(), peer_id, outbox);
                    if deliveries
                        .iter()
                        .any(|(_, f)| matches!(f, ServerFrame::Created { .. } | ServerFrame::Joined { .. }))
                    {
                        joined.insert(room);
                    }
                    deliveries
                }
                ClientFrame::Publish { room, payload } => {
                    trace!(%peer_id, %room, kind = payload.kind(), "relaying");
                    rooms.publish(&room, peer_id, outbox, payload)
                }
                ClientFrame::Leave { room } => {
                    joined.remove(&room);
                    rooms.leave(&room, peer_id)
                }
            }
        };
        deliver(deliveries).await;
    }
}

async fn deliver(deliveries: Vec<Delivery>) {
    for (outbox, frame) in deliveries {
        match serde_json::to_string(&frame) {
            Ok(json) => {
                let _ = outbox.send(tungstenite::Message::Text(json.into())).await;
            }
            Err(e) => error!("failed to encode relay frame: {e}"),
        }
    }
}
