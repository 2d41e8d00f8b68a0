use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use roomdrop_data_channel::DeliveryFlavor;
use roomdrop_session::memory::{MemoryNetwork, MemoryRelay};
use roomdrop_session::tcp::{TcpConnector, TcpPeerConfig};
use roomdrop_session::{
    NegotiationState, PeerConnector, Role, SessionConfig, SessionError, SessionEvent, SessionHandle,
};
use tokio::sync::mpsc;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn spawn(relay: &MemoryRelay, connector: Arc<dyn PeerConnector>, config: SessionConfig) -> SessionHandle {
    SessionHandle::spawn(Arc::new(relay.client()), connector, config)
}

async fn wait_for<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event stream ended");
        if pred(&event) {
            return event;
        }
    }
}

async fn states_until_connected(events: &mut mpsc::Receiver<SessionEvent>) -> Vec<NegotiationState> {
    let mut states = Vec::new();
    loop {
        if let SessionEvent::StateChanged(state) =
            wait_for(events, |e| matches!(e, SessionEvent::StateChanged(_))).await
        {
            states.push(state);
            if state == NegotiationState::Connected {
                return states;
            }
        }
    }
}

struct Pair {
    initiator: SessionHandle,
    initiator_events: mpsc::Receiver<SessionEvent>,
    joiner: SessionHandle,
    joiner_events: mpsc::Receiver<SessionEvent>,
}

/// Joins two sessions to `room`, the first one strictly before the second.
async fn join_pair(
    relay: &MemoryRelay,
    first: Arc<dyn PeerConnector>,
    second: Arc<dyn PeerConnector>,
    room: &str,
) -> Pair {
    let initiator = spawn(relay, first, SessionConfig::default());
    let mut initiator_events = initiator.take_events().unwrap();
    initiator.join_room(room).await.unwrap();
    wait_for(&mut initiator_events, |e| {
        *e == SessionEvent::RoleAssigned(Role::Initiator)
    })
    .await;

    let joiner = spawn(relay, second, SessionConfig::default());
    let joiner_events = joiner.take_events().unwrap();
    joiner.join_room(room).await.unwrap();

    Pair {
        initiator,
        initiator_events,
        joiner,
        joiner_events,
    }
}

fn memory_pair_connectors(flavor: DeliveryFlavor) -> (Arc<dyn PeerConnector>, Arc<dyn PeerConnector>) {
    let network = MemoryNetwork::new();
    (
        Arc::new(network.connector(DeliveryFlavor::Buffer)),
        Arc::new(network.connector(flavor)),
    )
}

fn patterned(len: usize) -> Bytes {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if let Some(last) = data.last_mut() {
        *last = 0xAB;
    }
    Bytes::from(data)
}

#[tokio::test]
async fn roles_are_exclusive_and_states_follow_the_negotiation() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-roles").await;

    let joiner_states = states_until_connected(&mut pair.joiner_events).await;
    assert_eq!(
        joiner_states,
        vec![
            NegotiationState::RoomPending,
            NegotiationState::RoleJoiner,
            NegotiationState::PeerReady,
            NegotiationState::Answering,
            NegotiationState::Connected,
        ]
    );

    let initiator_states = states_until_connected(&mut pair.initiator_events).await;
    assert_eq!(
        initiator_states,
        vec![
            NegotiationState::RoleCreator,
            NegotiationState::PeerReady,
            NegotiationState::Offering,
            NegotiationState::Connected,
        ]
    );

    pair.initiator.wait_connected().await.unwrap();
    pair.joiner.wait_connected().await.unwrap();

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn connected_event_carries_the_role() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-connected").await;

    assert_eq!(
        wait_for(&mut pair.joiner_events, |e| matches!(e, SessionEvent::Connected { .. })).await,
        SessionEvent::Connected { role: Role::Joiner }
    );
    assert_eq!(
        wait_for(&mut pair.initiator_events, |e| matches!(e, SessionEvent::Connected { .. })).await,
        SessionEvent::Connected {
            role: Role::Initiator
        }
    );

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn joining_twice_is_rejected() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let pair = join_pair(&relay, a, b, "room-twice").await;
    pair.joiner.wait_connected().await.unwrap();

    assert!(matches!(
        pair.joiner.join_room("room-twice").await,
        Err(SessionError::AlreadyJoined)
    ));
    assert_eq!(pair.joiner.state(), NegotiationState::Connected);

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn third_participant_is_turned_away() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let connector = || -> Arc<dyn PeerConnector> { Arc::new(network.connector(DeliveryFlavor::Buffer)) };
    let pair = join_pair(&relay, connector(), connector(), "room-full").await;
    pair.initiator.wait_connected().await.unwrap();
    pair.joiner.wait_connected().await.unwrap();

    let late = spawn(&relay, connector(), SessionConfig::default());
    let mut late_events = late.take_events().unwrap();
    late.join_room("room-full").await.unwrap();

    let failed = wait_for(&mut late_events, |e| matches!(e, SessionEvent::NegotiationFailed { .. })).await;
    assert_eq!(
        failed,
        SessionEvent::NegotiationFailed {
            reason: "room is full".into()
        }
    );
    wait_for(&mut late_events, |e| *e == SessionEvent::Closed).await;
    assert!(matches!(late.wait_connected().await, Err(SessionError::NotConnected)));

    // The established pair is untouched.
    assert_eq!(pair.initiator.state(), NegotiationState::Connected);
    assert_eq!(pair.joiner.state(), NegotiationState::Connected);

    late.shutdown().await;
    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn file_reaches_the_joiner_intact() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Blob);
    let mut pair = join_pair(&relay, a, b, "room-file").await;
    pair.initiator.wait_connected().await.unwrap();
    pair.joiner.wait_connected().await.unwrap();

    let payload = patterned(20_000);
    let report = pair
        .initiator
        .send_file(payload.clone(), Some("notes.txt".into()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.bytes_sent, 20_000);
    assert_eq!(report.chunks_sent, 2);

    assert_eq!(
        wait_for(&mut pair.joiner_events, |e| matches!(e, SessionEvent::TransferStarted { .. })).await,
        SessionEvent::TransferStarted {
            name: Some("notes.txt".into()),
            size: 20_000
        }
    );
    let SessionEvent::FileReceived { name, bytes } =
        wait_for(&mut pair.joiner_events, |e| matches!(e, SessionEvent::FileReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(name.as_deref(), Some("notes.txt"));
    assert_eq!(bytes.len(), 20_000);
    assert_eq!(bytes[19_999], 0xAB);
    assert_eq!(bytes, payload);

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn joiner_can_send_back() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-back").await;
    pair.joiner.wait_connected().await.unwrap();
    pair.initiator.wait_connected().await.unwrap();

    pair.joiner
        .send_file(Bytes::from_static(b"reply"), Some("reply.txt".into()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let received = wait_for(&mut pair.initiator_events, |e| {
        matches!(e, SessionEvent::FileReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        SessionEvent::FileReceived {
            name: Some("reply.txt".into()),
            bytes: Bytes::from_static(b"reply")
        }
    );

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn empty_file_completes_immediately() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-empty").await;
    pair.initiator.wait_connected().await.unwrap();

    let report = pair
        .initiator
        .send_file(Bytes::new(), Some("empty.bin".into()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.chunks_sent, 0);

    let received = wait_for(&mut pair.joiner_events, |e| {
        matches!(e, SessionEvent::FileReceived { .. })
    })
    .await;
    assert_eq!(
        received,
        SessionEvent::FileReceived {
            name: Some("empty.bin".into()),
            bytes: Bytes::new()
        }
    );

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn send_path_uses_the_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    tokio::fs::write(&path, vec![7u8; 40_000]).await.unwrap();

    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-path").await;
    pair.initiator.wait_connected().await.unwrap();

    let report = pair.initiator.send_path(&path).await.unwrap().wait().await.unwrap();
    assert_eq!(report.chunks_sent, 3);

    let SessionEvent::FileReceived { name, bytes } =
        wait_for(&mut pair.joiner_events, |e| matches!(e, SessionEvent::FileReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(name.as_deref(), Some("payload.bin"));
    assert_eq!(bytes.len(), 40_000);
    assert!(bytes.iter().all(|b| *b == 7));

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn sender_shutdown_after_send_still_delivers() {
    let relay = MemoryRelay::new();
    let (a, b) = memory_pair_connectors(DeliveryFlavor::Buffer);
    let mut pair = join_pair(&relay, a, b, "room-bye").await;
    pair.initiator.wait_connected().await.unwrap();

    pair.initiator
        .send_file(patterned(100_000), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    pair.initiator.shutdown().await;

    let mut received = false;
    loop {
        match wait_for(&mut pair.joiner_events, |e| {
            matches!(e, SessionEvent::FileReceived { .. } | SessionEvent::Closed)
        })
        .await
        {
            SessionEvent::FileReceived { name, bytes } => {
                assert_eq!(name, None);
                assert_eq!(bytes.len(), 100_000);
                received = true;
            }
            SessionEvent::Closed => break,
            _ => unreachable!(),
        }
    }
    assert!(received, "file must arrive before the session closes");
    assert_eq!(pair.joiner.state(), NegotiationState::Closed);
    pair.joiner.shutdown().await;
}

#[tokio::test]
async fn peer_leaving_before_connect_fails_the_negotiation() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();

    let initiator = spawn(
        &relay,
        Arc::new(network.connector(DeliveryFlavor::Buffer)),
        SessionConfig::default(),
    );
    let mut events = initiator.take_events().unwrap();
    initiator.join_room("room-left").await.unwrap();
    wait_for(&mut events, |e| *e == SessionEvent::RoleAssigned(Role::Initiator)).await;

    // A raw participant joins and leaves without ever answering.
    let visitor = relay.client();
    roomdrop_session::RendezvousClient::join_or_create(&visitor, "room-left".into())
        .await
        .unwrap();
    wait_for(&mut events, |e| {
        *e == SessionEvent::StateChanged(NegotiationState::Offering)
    })
    .await;
    drop(visitor);

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, SessionEvent::NegotiationFailed { .. })).await,
        SessionEvent::NegotiationFailed {
            reason: "peer left the room".into()
        }
    );
    wait_for(&mut events, |e| *e == SessionEvent::Closed).await;
    initiator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn negotiation_times_out_without_a_peer() {
    let relay = MemoryRelay::new();
    let network = MemoryNetwork::new();
    let config = SessionConfig {
        negotiation_timeout: Some(Duration::from_secs(2)),
        ..SessionConfig::default()
    };
    let handle = spawn(&relay, Arc::new(network.connector(DeliveryFlavor::Buffer)), config);
    let mut events = handle.take_events().unwrap();
    handle.join_room("room-alone").await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, SessionEvent::NegotiationFailed { .. })).await;
    assert_eq!(
        failed,
        SessionEvent::NegotiationFailed {
            reason: "negotiation timed out after 2s".into()
        }
    );
    assert!(matches!(handle.wait_connected().await, Err(SessionError::NotConnected)));
    assert_eq!(relay.participants(&"room-alone".into()), 0);
    handle.shutdown().await;
}

#[tokio::test]
async fn file_transfer_over_direct_tcp() {
    let relay = MemoryRelay::new();
    let a: Arc<dyn PeerConnector> = Arc::new(TcpConnector::new(TcpPeerConfig::loopback()));
    let b: Arc<dyn PeerConnector> = Arc::new(TcpConnector::new(TcpPeerConfig {
        flavor: DeliveryFlavor::Blob,
        ..TcpPeerConfig::loopback()
    }));
    let mut pair = join_pair(&relay, a, b, "room-tcp").await;
    pair.initiator.wait_connected().await.unwrap();
    pair.joiner.wait_connected().await.unwrap();

    let payload = patterned(70_000);
    pair.initiator
        .send_file(payload.clone(), Some("disk.img".into()))
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    let SessionEvent::FileReceived { name, bytes } =
        wait_for(&mut pair.joiner_events, |e| matches!(e, SessionEvent::FileReceived { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(name.as_deref(), Some("disk.img"));
    assert_eq!(bytes, payload);

    pair.initiator.shutdown().await;
    pair.joiner.shutdown().await;
}
