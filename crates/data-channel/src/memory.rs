//! In-process transport joining two links directly.

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::wire::Frame;
use crate::{ChannelLink, ChannelMessage, ChannelState, DataChannel, DeliveryFlavor};

/// Connects two links so that each one's outbound messages arrive at the
/// other, in order, and opens both channels.
///
/// Closing either channel closes both.
pub fn connect(a: ChannelLink, b: ChannelLink) {
    let ChannelLink {
        label: a_label,
        flavor: a_flavor,
        write_rx: a_write_rx,
        messages_tx: a_messages_tx,
        state_tx: a_state_tx,
        cancel: a_cancel,
    } = a;
    let ChannelLink {
        flavor: b_flavor,
        write_rx: b_write_rx,
        messages_tx: b_messages_tx,
        state_tx: b_state_tx,
        cancel: b_cancel,
        ..
    } = b;

    let pair_cancel = CancellationToken::new();

    tokio::spawn(forward(a_write_rx, b_messages_tx, b_flavor, pair_cancel.clone()));
    tokio::spawn(forward(b_write_rx, a_messages_tx, a_flavor, pair_cancel.clone()));

    a_state_tx.send_replace(ChannelState::Open);
    b_state_tx.send_replace(ChannelState::Open);
    debug!(label = %a_label, "in-memory data channel open");

    tokio::spawn(supervise(
        [a_cancel, b_cancel],
        [a_state_tx, b_state_tx],
        pair_cancel,
    ));
}

/// Creates two open channels connected to each other.
pub fn pair(label: &str, flavor: DeliveryFlavor) -> (DataChannel, DataChannel) {
    let (a, a_link) = DataChannel::new(label, flavor);
    let (b, b_link) = DataChannel::new(label, flavor);
    connect(a_link, b_link);
    (a, b)
}

async fn forward(
    mut from: mpsc::Receiver<Frame>,
    to: mpsc::Sender<ChannelMessage>,
    flavor: DeliveryFlavor,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(frame) = from.try_recv() {
                    let _ = to.send(ChannelMessage::deliver(frame, flavor)).await;
                }
                break;
            }
            frame = from.recv() => {
                let Some(frame) = frame else { break };
                // A dropped receiver discards the message, as a real peer would.
                let _ = to.send(ChannelMessage::deliver(frame, flavor)).await;
            }
        }
    }
    cancel.cancel();
}

async fn supervise(
    cancels: [CancellationToken; 2],
    states: [watch::Sender<ChannelState>; 2],
    pair_cancel: CancellationToken,
) {
    let [a, b] = &cancels;
    tokio::select! {
        _ = a.cancelled() => {}
        _ = b.cancelled() => {}
        _ = pair_cancel.cancelled() => {}
    }
    pair_cancel.cancel();
    for cancel in &cancels {
        cancel.cancel();
    }
    for state in &states {
        state.send_replace(ChannelState::Closed);
    }
}
