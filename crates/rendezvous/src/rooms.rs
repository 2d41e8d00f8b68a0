//! Room membership rules of the relay.

use std::collections::HashMap;

use roomdrop_protocol::{MAX_ROOM_PARTICIPANTS, RoomId, ServerFrame, SignalingMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tracing::debug;

/// Outbound queue of one relay connection.
pub(crate) type Outbox = mpsc::Sender<tungstenite::Message>;

/// A frame to write to a connection.
pub(crate) type Delivery = (Outbox, ServerFrame);

struct Member {
    peer_id: String,
    outbox: Outbox,
}

/// All rooms of one relay. Empty rooms are dropped.
#[derive(Default)]
pub(crate) struct Rooms {
    rooms: HashMap<RoomId, Vec<Member>>,
}

impl Rooms {
    pub(crate) fn occupancy(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }

    /// Adds `peer_id` to `room`, creating it when empty.
    pub(crate) fn join(&mut self, room: RoomId, peer_id: &str, outbox: &Outbox) -> Vec<Delivery> {
        let members = self.rooms.entry(room.clone()).or_default();

        if members.iter().any(|m| m.peer_id == peer_id) {
            return vec![(
                outbox.clone(),
                ServerFrame::Error {
                    message: format!("already in room {room}"),
                },
            )];
        }
        if members.len() >= MAX_ROOM_PARTICIPANTS {
            debug!(%room, %peer_id, "room full");
            return vec![(outbox.clone(), ServerFrame::Full { room })];
        }

        members.push(Member {
            peer_id: peer_id.to_string(),
            outbox: outbox.clone(),
        });

        if members.len() == 1 {
            debug!(%room, %peer_id, "room created");
            return vec![(
                outbox.clone(),
                ServerFrame::Created {
                    room,
                    peer_id: peer_id.to_string(),
                },
            )];
        }

        debug!(%room, %peer_id, "room joined");
        let mut deliveries = vec![(
            outbox.clone(),
            ServerFrame::Joined {
                room: room.clone(),
                peer_id: peer_id.to_string(),
            },
        )];
        for m in members.iter() {
            deliveries.push((m.outbox.clone(), ServerFrame::Ready { room: room.clone() }));
        }
        deliveries
    }

    /// Forwards `payload` to the other members of `room`.
    pub(crate) fn publish(
        &self,
        room: &RoomId,
        peer_id: &str,
        outbox: &Outbox,
        payload: SignalingMessage,
    ) -> Vec<Delivery> {
        let Some(members) = self
            .rooms
            .get(room)
            .filter(|members| members.iter().any(|m| m.peer_id == peer_id))
        else {
            return vec![(
                outbox.clone(),
                ServerFrame::Error {
                    message: format!("not in room {room}"),
                },
            )];
        };

        members
            .iter()
            .filter(|m| m.peer_id != peer_id)
            .map(|m| {
                (
                    m.outbox.clone(),
                    ServerFrame::Message {
                        room: room.clone(),
                        payload: payload.clone(),
                    },
                )
            })
            .collect()
    }

    /// Removes `peer_id` from `room` and tells whoever remains.
    pub(crate) fn leave(&mut self, room: &RoomId, peer_id: &str) -> Vec<Delivery> {
        let Some(members) = self.rooms.get_mut(room) else {
            return Vec::new();
        };
        let before = members.len();
        members.retain(|m| m.peer_id != peer_id);
        if members.len() == before {
            return Vec::new();
        }
        debug!(%room, %peer_id, "left room");

        let deliveries = members
            .iter()
            .map(|m| (m.outbox.clone(), ServerFrame::PeerLeft { room: room.clone() }))
            .collect();
        if members.is_empty() {
            self.rooms.remove(room);
        }
        deliveries
    }
}
