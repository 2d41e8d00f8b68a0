//! In-process rendezvous relay and loopback peer connections.
//!
//! Both follow the same rules as their networked counterparts so that two
//! sessions in one process negotiate exactly as they would across hosts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use roomdrop_data_channel::{ChannelLink, DataChannel, DeliveryFlavor, memory};
use roomdrop_protocol::{IceCandidate, MAX_ROOM_PARTICIPANTS, RoomId, SessionDescription, SignalingMessage};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::BoxFuture;
use crate::error::{NegotiationError, RendezvousError};
use crate::peer::{PEER_EVENT_CAPACITY, PeerConnection, PeerConnector, PeerEvent};
use crate::rendezvous::{RendezvousClient, RoomEvent};
use crate::token::SessionToken;

/// Capacity of a participant's room event queue.
const ROOM_EVENT_CAPACITY: usize = 64;

/// Protocol tag carried in loopback descriptions.
const MEMORY_PROTO: &str = "roomdrop-memory";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Rendezvous
// ---------------------------------------------------------------------------

struct Participant {
    peer_id: String,
    events: mpsc::Sender<RoomEvent>,
}

type Delivery = (mpsc::Sender<RoomEvent>, RoomEvent);

/// Room registry shared by all [`MemoryRendezvous`] clients it hands out.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    rooms: Arc<Mutex<HashMap<RoomId, Vec<Participant>>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client with a fresh peer id.
    pub fn client(&self) -> MemoryRendezvous {
        let (events_tx, events_rx) = mpsc::channel(ROOM_EVENT_CAPACITY);
        MemoryRendezvous {
            relay: self.clone(),
            peer_id: uuid::Uuid::new_v4().to_string(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            room: Mutex::new(None),
        }
    }

    /// Number of participants currently in `room`.
    pub fn participants(&self, room: &RoomId) -> usize {
        lock(&self.rooms).get(room).map_or(0, Vec::len)
    }

    fn join(&self, room: &RoomId, peer_id: &str, events: &mpsc::Sender<RoomEvent>) -> (bool, Vec<Delivery>) {
        let mut rooms = lock(&self.rooms);
        let participants = rooms.entry(room.clone()).or_default();

        if participants.iter().any(|p| p.peer_id == peer_id) {
            debug!(%room, %peer_id, "already in room");
            return (true, Vec::new());
        }
        if participants.len() >= MAX_ROOM_PARTICIPANTS {
            debug!(%room, %peer_id, "room full");
            return (false, vec![(events.clone(), RoomEvent::Full)]);
        }

        participants.push(Participant {
            peer_id: peer_id.to_string(),
            events: events.clone(),
        });

        let mut deliveries = Vec::new();
        if participants.len() == 1 {
            debug!(%room, %peer_id, "room created");
            deliveries.push((
                events.clone(),
                RoomEvent::Created {
                    peer_id: peer_id.to_string(),
                },
            ));
        } else {
            debug!(%room, %peer_id, "room joined");
            deliveries.push((
                events.clone(),
                RoomEvent::Joined {
                    peer_id: peer_id.to_string(),
                },
            ));
            for p in participants.iter() {
                deliveries.push((p.events.clone(), RoomEvent::Ready));
            }
        }
        (true, deliveries)
    }

    fn others(&self, room: &RoomId, peer_id: &str) -> Vec<mpsc::Sender<RoomEvent>> {
        lock(&self.rooms)
            .get(room)
            .map(|participants| {
                participants
                    .iter()
                    .filter(|p| p.peer_id != peer_id)
                    .map(|p| p.events.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove(&self, room: &RoomId, peer_id: &str) -> Vec<mpsc::Sender<RoomEvent>> {
        let mut rooms = lock(&self.rooms);
        let Some(participants) = rooms.get_mut(room) else {
            return Vec::new();
        };
        participants.retain(|p| p.peer_id != peer_id);
        let others = participants.iter().map(|p| p.events.clone()).collect();
        if participants.is_empty() {
            rooms.remove(room);
        }
        others
    }
}

/// One participant's connection to a [`MemoryRelay`].
pub struct MemoryRendezvous {
    relay: MemoryRelay,
    peer_id: String,
    events_tx: mpsc::Sender<RoomEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<RoomEvent>>>,
    room: Mutex<Option<RoomId>>,
}

impl MemoryRendezvous {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

impl RendezvousClient for MemoryRendezvous {
    fn join_or_create(&self, room: RoomId) -> BoxFuture<'_, Result<(), RendezvousError>> {
        let (joined, deliveries) = self.relay.join(&room, &self.peer_id, &self.events_tx);
        if joined {
            *lock(&self.room) = Some(room);
        }
        Box::pin(async move {
            for (tx, event) in deliveries {
                let _ = tx.send(event).await;
            }
            Ok(())
        })
    }

    fn publish(&self, message: SignalingMessage) -> BoxFuture<'_, Result<(), RendezvousError>> {
        let room = lock(&self.room).clone();
        Box::pin(async move {
            let room = room.ok_or(RendezvousError::NotJoined)?;
            let others = self.relay.others(&room, &self.peer_id);
            if others.is_empty() {
                debug!(%room, kind = message.kind(), "no peer in room, message dropped");
            }
            for tx in others {
                let _ = tx.send(RoomEvent::Message(message.clone())).await;
            }
            Ok(())
        })
    }

    fn leave(&self) -> BoxFuture<'_, ()> {
        let room = lock(&self.room).take();
        Box::pin(async move {
            let Some(room) = room else { return };
            for tx in self.relay.remove(&room, &self.peer_id) {
                let _ = tx.send(RoomEvent::PeerLeft).await;
            }
        })
    }

    fn take_events(&self) -> Option<mpsc::Receiver<RoomEvent>> {
        lock(&self.events_rx).take()
    }
}

impl Drop for MemoryRendezvous {
    fn drop(&mut self) {
        if let Some(room) = lock(&self.room).take() {
            for tx in self.relay.remove(&room, &self.peer_id) {
                let _ = tx.try_send(RoomEvent::PeerLeft);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loopback peer connections
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct MemoryDescription {
    proto: String,
    session: String,
    label: String,
}

impl MemoryDescription {
    fn new(session: &SessionToken, label: &str) -> Self {
        Self {
            proto: MEMORY_PROTO.to_string(),
            session: session.as_str().to_string(),
            label: label.to_string(),
        }
    }

    fn encode(&self) -> Result<SessionDescription, NegotiationError> {
        serde_json::to_string(self)
            .map(SessionDescription::new)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))
    }

    fn decode(description: &SessionDescription) -> Result<Self, NegotiationError> {
        let parsed: Self = serde_json::from_str(&description.sdp)
            .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?;
        if parsed.proto != MEMORY_PROTO {
            return Err(NegotiationError::InvalidDescription(format!(
                "unsupported protocol {}",
                parsed.proto
            )));
        }
        Ok(parsed)
    }
}

/// Process-wide table of offered channels, keyed by session token.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    offers: Arc<Mutex<HashMap<String, ChannelLink>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector whose channels deliver binary messages as `flavor`.
    pub fn connector(&self, flavor: DeliveryFlavor) -> MemoryConnector {
        MemoryConnector {
            network: self.clone(),
            flavor,
        }
    }
}

/// Builds loopback connections on a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
    flavor: DeliveryFlavor,
}

impl PeerConnector for MemoryConnector {
    fn connect(
        &self,
    ) -> BoxFuture<'_, Result<(Box<dyn PeerConnection>, mpsc::Receiver<PeerEvent>), NegotiationError>> {
        let (events, events_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let peer = MemoryPeer {
            network: self.network.clone(),
            flavor: self.flavor,
            events,
            label: None,
            link: None,
            offered: None,
            remote_offer: None,
        };
        Box::pin(async move { Ok((Box::new(peer) as Box<dyn PeerConnection>, events_rx)) })
    }
}

struct MemoryPeer {
    network: MemoryNetwork,
    flavor: DeliveryFlavor,
    events: mpsc::Sender<PeerEvent>,
    label: Option<String>,
    link: Option<ChannelLink>,
    offered: Option<SessionToken>,
    remote_offer: Option<MemoryDescription>,
}

impl PeerConnection for MemoryPeer {
    fn create_data_channel(&mut self, label: &str) -> Result<DataChannel, NegotiationError> {
        let (channel, link) = DataChannel::new(label, self.flavor);
        self.label = Some(label.to_string());
        self.link = Some(link);
        Ok(channel)
    }

    fn create_offer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>> {
        Box::pin(async move {
            let (Some(link), Some(label)) = (self.link.take(), self.label.clone()) else {
                return Err(NegotiationError::NoDataChannel);
            };
            let token = SessionToken::generate();
            lock(&self.network.offers).insert(token.as_str().to_string(), link);
            let description = MemoryDescription::new(&token, &label).encode()?;
            self.offered = Some(token);

            let mut candidate = IceCandidate::new(format!("{MEMORY_PROTO} loopback"));
            candidate.sdp_mid = Some(label);
            candidate.sdp_m_line_index = Some(0);
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate)).await;
            Ok(description)
        })
    }

    fn create_answer(&mut self) -> BoxFuture<'_, Result<SessionDescription, NegotiationError>> {
        Box::pin(async move {
            let offer = self
                .remote_offer
                .as_ref()
                .ok_or(NegotiationError::NoRemoteOffer)?;
            let remote_link = lock(&self.network.offers)
                .remove(&offer.session)
                .ok_or_else(|| NegotiationError::Connection("offered channel no longer available".into()))?;

            let (channel, link) = DataChannel::new(offer.label.as_str(), self.flavor);
            memory::connect(remote_link, link);
            debug!(label = %offer.label, "loopback channel connected");

            let answer = SessionDescription::new(
                serde_json::to_string(offer)
                    .map_err(|e| NegotiationError::InvalidDescription(e.to_string()))?,
            );
            let _ = self.events.send(PeerEvent::DataChannel(channel)).await;
            Ok(answer)
        })
    }

    fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> BoxFuture<'_, Result<(), NegotiationError>> {
        Box::pin(async move {
            let remote = MemoryDescription::decode(&description)?;
            match &self.offered {
                Some(token) if token.matches(&remote.session) => Ok(()),
                Some(_) => Err(NegotiationError::InvalidDescription(
                    "answer does not match our offer".into(),
                )),
                None => {
                    self.remote_offer = Some(remote);
                    Ok(())
                }
            }
        })
    }

    fn add_candidate(&mut self, candidate: IceCandidate) -> BoxFuture<'_, Result<(), NegotiationError>> {
        trace!(candidate = %candidate.candidate, "loopback candidate ignored");
        Box::pin(async { Ok(()) })
    }

    fn close(&mut self) {
        if let Some(token) = self.offered.take() {
            if let Some(link) = lock(&self.network.offers).remove(token.as_str()) {
                link.abandon();
            }
        }
        if let Some(link) = self.link.take() {
            link.abandon();
        }
    }
}
