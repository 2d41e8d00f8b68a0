//! Public session surface: one spawned coordinator task behind a handle.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use roomdrop_data_channel::DataChannel;
use roomdrop_protocol::RoomId;
use roomdrop_transfer::{
    ChunkSender, ChunkSource, FileSource, ReceiverConfig, SendHandle, SenderConfig,
    TransferProgress,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coordinator::{NegotiationCoordinator, NegotiationState, Role};
use crate::error::SessionError;
use crate::peer::PeerConnector;
use crate::rendezvous::RendezvousClient;

/// Capacity of the session event queue.
const EVENT_CAPACITY: usize = 256;

/// Capacity of the command queue.
const COMMAND_CAPACITY: usize = 16;

/// Session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Give up if the channel is not open this long after `join_room`.
    pub negotiation_timeout: Option<Duration>,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
}

/// Events emitted by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(NegotiationState),
    RoleAssigned(Role),
    /// The data channel is open.
    Connected { role: Role },
    /// The peer announced a file.
    TransferStarted { name: Option<String>, size: u64 },
    TransferProgress(TransferProgress),
    /// A file arrived complete. `name` is the sender's suggestion, unvalidated.
    FileReceived { name: Option<String>, bytes: Bytes },
    TransferFailed { reason: String },
    NegotiationFailed { reason: String },
    Closed,
}

enum Command {
    JoinRoom {
        room: RoomId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Channel {
        reply: oneshot::Sender<Option<DataChannel>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle on a running session.
///
/// All negotiation happens on a background task; the handle only sends
/// commands to it and observes its state and events.
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    state_rx: watch::Receiver<NegotiationState>,
    sender_config: SenderConfig,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    /// Spawns the session task. The session starts in `Idle`.
    pub fn spawn(
        rendezvous: Arc<dyn RendezvousClient>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(NegotiationState::Idle);
        let cancel = CancellationToken::new();
        let sender_config = config.sender.clone();

        let coordinator = NegotiationCoordinator::new(rendezvous, connector, config, events_tx);
        let task = tokio::spawn(run(coordinator, commands_rx, state_tx, cancel.clone()));

        Self {
            commands: commands_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state_rx,
            sender_config,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Takes the event receiver. Can only be called once.
    ///
    /// The receiver must be drained: the session task waits when it is full.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().ok().and_then(|mut guard| guard.take())
    }

    pub fn state(&self) -> NegotiationState {
        *self.state_rx.borrow()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<NegotiationState> {
        self.state_rx.clone()
    }

    /// Joins `room`, creating it if needed. Returns once the request is sent;
    /// progress is reported through events.
    pub async fn join_room(&self, room: impl Into<RoomId>) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::JoinRoom {
            room: room.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Waits until the channel opens. Fails if the session closes first.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut rx = self.state_rx.clone();
        let connected = *rx
            .wait_for(|s| matches!(s, NegotiationState::Connected | NegotiationState::Closed))
            .await
            .map_err(|_| SessionError::Stopped)?
            == NegotiationState::Connected;
        if connected {
            Ok(())
        } else {
            Err(SessionError::NotConnected)
        }
    }

    /// Sends `source` to the peer. Only valid while `Connected`.
    pub async fn send_file<S>(&self, source: S, name: Option<String>) -> Result<SendHandle, SessionError>
    where
        S: ChunkSource + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Channel { reply }).await?;
        let channel = rx
            .await
            .map_err(|_| SessionError::Stopped)?
            .ok_or(SessionError::NotConnected)?;

        info!(?name, size = source.size(), "starting file send");
        Ok(ChunkSender::new(channel, self.sender_config.clone()).send(source, name))
    }

    /// Sends the file at `path`, suggesting its file name to the peer.
    pub async fn send_path(&self, path: &Path) -> Result<SendHandle, SessionError> {
        let source = FileSource::open(path).await?;
        let name = source.file_name();
        self.send_file(source, name).await
    }

    /// Closes the session and stops its task. Idempotent.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
        self.cancel.cancel();

        let task = self.task.lock().ok().and_then(|mut guard| guard.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn command(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Stopped)
    }
}

async fn run(
    mut coordinator: NegotiationCoordinator,
    mut commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<NegotiationState>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                coordinator.shutdown().await;
                break;
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    coordinator.shutdown().await;
                    break;
                };
                match command {
                    Command::JoinRoom { room, reply } => {
                        let result = coordinator.join_room(room).await;
                        let _ = reply.send(result);
                    }
                    Command::Channel { reply } => {
                        let _ = reply.send(coordinator.connected_channel());
                    }
                    Command::Shutdown { reply } => {
                        coordinator.shutdown().await;
                        state_tx.send_replace(coordinator.session().state);
                        let _ = reply.send(());
                        break;
                    }
                }
            }
            input = coordinator.next_input() => coordinator.apply(input).await,
        }

        let current = coordinator.session().state;
        state_tx.send_if_modified(|s| std::mem::replace(s, current) != current);
    }

    state_tx.send_replace(coordinator.session().state);
    debug!("session task stopped");
}
