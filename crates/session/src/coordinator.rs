//! Negotiation state machine turning a room into an open data channel.
//!
//! ```text
//! Idle -> RoomPending -> RoleCreator -> PeerReady -> Offering  -> Connected -> Closed
//!                     \-> RoleJoiner -> PeerReady -> Answering -/
//! ```
//!
//! The coordinator owns the [`Session`] and is driven by one task: room
//! events from the rendezvous, events from the peer connection, channel
//! state changes and receiver events are all applied sequentially.

use std::fmt;
use std::sync::Arc;

use roomdrop_data_channel::{ChannelError, ChannelState, DataChannel};
use roomdrop_protocol::{DATA_CHANNEL_LABEL, IceCandidate, RoomId, SessionDescription, SignalingMessage};
use roomdrop_transfer::{ChunkReceiver, TransferEvent};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{NegotiationError, RendezvousError, SessionError};
use crate::handle::{SessionConfig, SessionEvent};
use crate::peer::{PeerConnection, PeerConnector, PeerEvent};
use crate::rendezvous::{RendezvousClient, RoomEvent};

/// Capacity of the receiver-to-coordinator event queue.
const TRANSFER_EVENT_CAPACITY: usize = 64;

/// Negotiation progress of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NegotiationState {
    #[default]
    Idle,
    /// Join-or-create sent, waiting for the room's answer.
    RoomPending,
    /// This side created the room (Initiator).
    RoleCreator,
    /// This side joined an existing room (Joiner).
    RoleJoiner,
    /// Both participants are in the room.
    PeerReady,
    /// Offer published, waiting for the answer.
    Offering,
    /// Offer applied, answer published.
    Answering,
    /// Data channel open.
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::RoomPending => "room-pending",
            Self::RoleCreator => "role-creator",
            Self::RoleJoiner => "role-joiner",
            Self::PeerReady => "peer-ready",
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the negotiation this participant plays.
///
/// Assigned once per room session, never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Created the room; creates the data channel and sends the offer.
    Initiator,
    /// Joined the room; answers the offer and adopts the remote channel.
    Joiner,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initiator => "initiator",
            Self::Joiner => "joiner",
        })
    }
}

/// Per-room session state owned by the coordinator.
#[derive(Debug, Default)]
pub struct Session {
    pub room: Option<RoomId>,
    pub role: Option<Role>,
    pub state: NegotiationState,
    /// The negotiated channel, once created (Initiator) or adopted (Joiner).
    pub channel: Option<DataChannel>,
    /// Set once the channel opens; room lifecycle events are ignored while set.
    pub in_progress: bool,
}

/// Something the coordinator task has to react to.
pub(crate) enum Input {
    Room(Option<RoomEvent>),
    Peer(Option<PeerEvent>),
    Channel(ChannelState),
    Transfer(Option<TransferEvent>),
    Deadline,
}

/// Drives one [`Session`] from `Idle` to `Closed`.
pub struct NegotiationCoordinator {
    session: Session,
    rendezvous: Arc<dyn RendezvousClient>,
    connector: Arc<dyn PeerConnector>,
    config: SessionConfig,
    events_tx: mpsc::Sender<SessionEvent>,
    room_events: Option<mpsc::Receiver<RoomEvent>>,
    connection: Option<Box<dyn PeerConnection>>,
    peer_events: Option<mpsc::Receiver<PeerEvent>>,
    channel_state: Option<watch::Receiver<ChannelState>>,
    transfer_events: Option<mpsc::Receiver<TransferEvent>>,
    remote_answer_applied: bool,
    /// The channel closed while the receiver still had messages to drain.
    close_after_drain: bool,
    deadline: Option<Instant>,
}

impl NegotiationCoordinator {
    /// Creates a coordinator in `Idle`. Takes the rendezvous event receiver.
    pub fn new(
        rendezvous: Arc<dyn RendezvousClient>,
        connector: Arc<dyn PeerConnector>,
        config: SessionConfig,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let room_events = rendezvous.take_events();
        if room_events.is_none() {
            warn!("rendezvous events already taken, room events will not be seen");
        }
        Self {
            session: Session::default(),
            rendezvous,
            connector,
            config,
            events_tx,
            room_events,
            connection: None,
            peer_events: None,
            channel_state: None,
            transfer_events: None,
            remote_answer_applied: false,
            close_after_drain: false,
            deadline: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The open channel, only while `Connected`.
    pub fn connected_channel(&self) -> Option<DataChannel> {
        if self.session.state == NegotiationState::Connected {
            self.session.channel.clone()
        } else {
            None
        }
    }

    /// Starts negotiation for `room`. Only valid from `Idle`.
    pub async fn join_room(&mut self, room: RoomId) -> Result<(), SessionError> {
        if self.session.state != NegotiationState::Idle {
            return Err(SessionError::AlreadyJoined);
        }

        info!(%room, "joining room");
        self.session.room = Some(room.clone());
        self.deadline = self.config.negotiation_timeout.map(|t| Instant::now() + t);
        self.set_state(NegotiationState::RoomPending).await;

        if let Err(e) = self.rendezvous.join_or_create(room).await {
            warn!(error = %e, "join-or-create failed");
            self.emit(SessionEvent::NegotiationFailed {
                reason: e.to_string(),
            })
            .await;
            self.close(false).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes the session, telling the peer if negotiation had started.
    pub async fn shutdown(&mut self) {
        self.close(true).await;
    }

    // -----------------------------------------------------------------------
    // Room events
    // -----------------------------------------------------------------------

    pub async fn handle_room_event(&mut self, event: RoomEvent) {
        if self.session.state == NegotiationState::Closed {
            trace!(?event, "session closed, ignoring room event");
            return;
        }
        if self.session.in_progress && event.is_lifecycle() {
            debug!(?event, "transfer session in progress, ignoring room event");
            return;
        }

        match event {
            RoomEvent::Created { peer_id } => self.on_created(peer_id).await,
            RoomEvent::Joined { peer_id } => self.on_joined(peer_id).await,
            RoomEvent::Ready => self.on_ready().await,
            RoomEvent::Message(message) => self.handle_signal(message).await,
            RoomEvent::Full => {
                warn!(room = ?self.session.room, "room is full");
                self.fail(NegotiationError::RoomFull).await;
            }
            RoomEvent::PeerLeft => {
                info!("peer left before the channel opened");
                self.fail(NegotiationError::PeerLeft).await;
            }
            RoomEvent::Disconnected => {
                warn!("rendezvous connection lost during negotiation");
                self.fail(RendezvousError::Closed.into()).await;
            }
        }
    }

    async fn on_created(&mut self, peer_id: String) {
        if self.session.state != NegotiationState::RoomPending || self.session.role.is_some() {
            debug!(%peer_id, state = %self.session.state, "ignoring created");
            return;
        }
        info!(room = ?self.session.room, %peer_id, "room created, acting as initiator");
        self.assign_role(Role::Initiator).await;
        self.set_state(NegotiationState::RoleCreator).await;
    }

    async fn on_joined(&mut self, peer_id: String) {
        if self.session.role == Some(Role::Initiator) {
            debug!(%peer_id, "peer joined our room");
            return;
        }
        if self.session.state != NegotiationState::RoomPending || self.session.role.is_some() {
            debug!(%peer_id, state = %self.session.state, "ignoring joined");
            return;
        }
        info!(room = ?self.session.room, %peer_id, "joined room, acting as joiner");
        self.assign_role(Role::Joiner).await;
        self.set_state(NegotiationState::RoleJoiner).await;
        if let Err(e) = self.ensure_connection().await {
            self.fail(e).await;
        }
    }

    async fn on_ready(&mut self) {
        match (self.session.role, self.session.state) {
            (Some(Role::Initiator), NegotiationState::RoleCreator) => {
                self.set_state(NegotiationState::PeerReady).await;
                if let Err(e) = self.start_offer().await {
                    self.fail(e).await;
                }
            }
            (Some(Role::Joiner), NegotiationState::RoleJoiner) => {
                self.set_state(NegotiationState::PeerReady).await;
                if let Err(e) = self.ensure_connection().await {
                    self.fail(e).await;
                }
            }
            (role, state) => debug!(?role, %state, "ignoring ready"),
        }
    }

    async fn start_offer(&mut self) -> Result<(), NegotiationError> {
        self.ensure_connection().await?;
        let channel = self.connection_mut()?.create_data_channel(DATA_CHANNEL_LABEL)?;
        debug!(label = channel.label(), "local data channel created");
        self.attach_channel(channel).await;

        self.set_state(NegotiationState::Offering).await;
        let offer = self.connection_mut()?.create_offer().await?;
        self.rendezvous.publish(SignalingMessage::Offer(offer)).await?;
        info!("offer published");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Signaling
    // -----------------------------------------------------------------------

    async fn handle_signal(&mut self, message: SignalingMessage) {
        debug!(kind = message.kind(), state = %self.session.state, "signaling message");
        let result = match message {
            SignalingMessage::Offer(offer) => self.on_offer(offer).await,
            SignalingMessage::Answer(answer) => self.on_answer(answer).await,
            SignalingMessage::Candidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
            SignalingMessage::Bye => {
                self.on_bye().await;
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail(e).await;
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        let expected = self.session.role == Some(Role::Joiner)
            && matches!(
                self.session.state,
                NegotiationState::RoleJoiner | NegotiationState::PeerReady
            );
        if !expected {
            warn!(role = ?self.session.role, state = %self.session.state, "dropping unexpected offer");
            return Ok(());
        }

        self.ensure_connection().await?;
        self.set_state(NegotiationState::Answering).await;

        let connection = self.connection_mut()?;
        connection.set_remote_description(offer).await?;
        let answer = connection.create_answer().await?;
        self.rendezvous.publish(SignalingMessage::Answer(answer)).await?;
        info!("answer published");
        Ok(())
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.session.state != NegotiationState::Offering || self.remote_answer_applied {
            debug!(state = %self.session.state, "dropping unexpected answer");
            return Ok(());
        }
        self.remote_answer_applied = true;
        self.connection_mut()?.set_remote_description(answer).await?;
        debug!("answer applied");
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(connection) = self.connection.as_mut() else {
            debug!(candidate = %candidate.candidate, "candidate arrived before the peer connection, dropping");
            return;
        };
        if let Err(e) = connection.add_candidate(candidate).await {
            warn!(error = %e, "dropping remote candidate");
        }
    }

    async fn on_bye(&mut self) {
        if self.session.in_progress {
            // The channel closes right behind; closing it here could cut
            // off chunks still in flight.
            debug!("peer said bye, waiting for the channel to close");
            return;
        }
        info!("peer said bye");
        self.close(false).await;
    }

    // -----------------------------------------------------------------------
    // Peer connection and channel
    // -----------------------------------------------------------------------

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.session.state == NegotiationState::Closed {
            if let PeerEvent::DataChannel(channel) = event {
                channel.close();
            }
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                trace!(candidate = %candidate.candidate, "publishing local candidate");
                if let Err(e) = self
                    .rendezvous
                    .publish(SignalingMessage::Candidate(candidate))
                    .await
                {
                    warn!(error = %e, "failed to publish candidate");
                }
            }
            PeerEvent::DataChannel(channel) => {
                if self.session.role != Some(Role::Joiner) || self.session.channel.is_some() {
                    warn!(label = channel.label(), "unexpected remote data channel, closing it");
                    channel.close();
                    return;
                }
                info!(label = channel.label(), "remote data channel available");
                self.attach_channel(channel).await;
            }
            PeerEvent::Failed(reason) => {
                if self.session.in_progress {
                    debug!(%reason, "peer connection reported failure after the channel opened");
                } else {
                    self.fail(NegotiationError::Connection(reason)).await;
                }
            }
        }
    }

    async fn attach_channel(&mut self, channel: DataChannel) {
        let mut state_rx = channel.watch_state();
        let current = *state_rx.borrow_and_update();
        self.session.channel = Some(channel);
        self.channel_state = Some(state_rx);
        if current != ChannelState::Connecting {
            self.handle_channel_state(current).await;
        }
    }

    pub async fn handle_channel_state(&mut self, state: ChannelState) {
        match state {
            ChannelState::Connecting => {}
            ChannelState::Open => {
                if self.session.in_progress || self.session.state == NegotiationState::Closed {
                    return;
                }
                let Some(channel) = self.session.channel.clone() else {
                    return;
                };
                self.session.in_progress = true;
                self.deadline = None;
                self.set_state(NegotiationState::Connected).await;
                info!(
                    room = ?self.session.room,
                    role = ?self.session.role,
                    label = channel.label(),
                    "data channel connected"
                );
                if let Some(role) = self.session.role {
                    self.emit(SessionEvent::Connected { role }).await;
                }
                self.start_receiver(&channel);
            }
            ChannelState::Closed => {
                self.channel_state = None;
                if self.session.state == NegotiationState::Closed {
                    return;
                }
                if !self.session.in_progress {
                    self.fail(ChannelError::Closed.into()).await;
                } else if self.transfer_events.is_some() {
                    debug!("data channel closed, draining receiver");
                    self.close_after_drain = true;
                } else {
                    info!("data channel closed");
                    self.close(false).await;
                }
            }
        }
    }

    fn start_receiver(&mut self, channel: &DataChannel) {
        let Some(messages) = channel.take_messages() else {
            warn!(label = channel.label(), "channel messages already taken, not receiving");
            return;
        };
        let receiver = ChunkReceiver::for_channel(channel, self.config.receiver.clone());
        let (tx, rx) = mpsc::channel(TRANSFER_EVENT_CAPACITY);
        tokio::spawn(receiver.run(messages, tx));
        self.transfer_events = Some(rx);
    }

    async fn handle_transfer_event(&mut self, event: TransferEvent) {
        let event = match event {
            TransferEvent::Started(metadata) => SessionEvent::TransferStarted {
                name: metadata.name,
                size: metadata.size,
            },
            TransferEvent::Progress(progress) => SessionEvent::TransferProgress(progress),
            TransferEvent::Completed(file) => SessionEvent::FileReceived {
                name: file.name,
                bytes: file.data,
            },
            TransferEvent::Failed(e) => SessionEvent::TransferFailed {
                reason: e.to_string(),
            },
        };
        self.emit(event).await;
    }

    // -----------------------------------------------------------------------
    // Task plumbing
    // -----------------------------------------------------------------------

    /// Waits for the next thing to react to.
    pub(crate) async fn next_input(&mut self) -> Input {
        tokio::select! {
            event = recv_or_pending(&mut self.room_events) => Input::Room(event),
            event = recv_or_pending(&mut self.peer_events) => Input::Peer(event),
            state = channel_change(&mut self.channel_state) => Input::Channel(state),
            event = recv_or_pending(&mut self.transfer_events) => Input::Transfer(event),
            _ = sleep_until(self.deadline) => Input::Deadline,
        }
    }

    pub(crate) async fn apply(&mut self, input: Input) {
        match input {
            Input::Room(Some(event)) => self.handle_room_event(event).await,
            Input::Room(None) => {
                self.room_events = None;
                self.handle_room_event(RoomEvent::Disconnected).await;
            }
            Input::Peer(Some(event)) => self.handle_peer_event(event).await,
            Input::Peer(None) => {
                trace!("peer connection event stream ended");
                self.peer_events = None;
            }
            Input::Channel(state) => self.handle_channel_state(state).await,
            Input::Transfer(Some(event)) => self.handle_transfer_event(event).await,
            Input::Transfer(None) => {
                self.transfer_events = None;
                if std::mem::take(&mut self.close_after_drain) {
                    info!("data channel closed");
                    self.close(false).await;
                }
            }
            Input::Deadline => {
                self.deadline = None;
                if let Some(timeout) = self.config.negotiation_timeout {
                    if !self.session.in_progress {
                        self.fail(NegotiationError::Timeout(timeout)).await;
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn ensure_connection(&mut self) -> Result<(), NegotiationError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let (connection, events) = self.connector.connect().await?;
        debug!("peer connection built");
        self.connection = Some(connection);
        self.peer_events = Some(events);
        Ok(())
    }

    fn connection_mut(&mut self) -> Result<&mut Box<dyn PeerConnection>, NegotiationError> {
        self.connection
            .as_mut()
            .ok_or_else(|| NegotiationError::Connection("peer connection not built".into()))
    }

    async fn assign_role(&mut self, role: Role) {
        self.session.role = Some(role);
        self.emit(SessionEvent::RoleAssigned(role)).await;
    }

    async fn set_state(&mut self, state: NegotiationState) {
        if self.session.state == state {
            return;
        }
        debug!(from = %self.session.state, to = %state, "negotiation state");
        self.session.state = state;
        self.emit(SessionEvent::StateChanged(state)).await;
    }

    async fn emit(&mut self, event: SessionEvent) {
        let _ = self.events_tx.send(event).await;
    }

    async fn fail(&mut self, error: NegotiationError) {
        if self.session.state == NegotiationState::Closed {
            return;
        }
        warn!(error = %error, state = %self.session.state, "negotiation failed");
        self.emit(SessionEvent::NegotiationFailed {
            reason: error.to_string(),
        })
        .await;
        self.close(true).await;
    }

    async fn close(&mut self, notify_peer: bool) {
        if self.session.state == NegotiationState::Closed {
            return;
        }

        let negotiating = self.session.state != NegotiationState::Idle;
        if notify_peer && negotiating {
            if let Err(e) = self.rendezvous.publish(SignalingMessage::Bye).await {
                debug!(error = %e, "could not send bye");
            }
        }
        if let Some(channel) = &self.session.channel {
            channel.close();
        }
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        self.peer_events = None;
        self.deadline = None;
        self.session.in_progress = false;

        self.set_state(NegotiationState::Closed).await;
        self.emit(SessionEvent::Closed).await;
        if negotiating {
            self.rendezvous.leave().await;
        }
        info!(room = ?self.session.room, "session closed");
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn channel_change(rx: &mut Option<watch::Receiver<ChannelState>>) -> ChannelState {
    let Some(rx) = rx else {
        return std::future::pending().await;
    };
    match rx.changed().await {
        Ok(()) => *rx.borrow_and_update(),
        Err(_) => ChannelState::Closed,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
