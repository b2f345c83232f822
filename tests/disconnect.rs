mod common;

use common::{connects, disconnects, loopback_host, pump_until, received_payloads};
use xudp::{CloseMode, CompressionLevel, Event, Host, Packet, PeerId, PeerState};

async fn connected_pair() -> (Host, Host, PeerId, PeerId) {
    let mut a = loopback_host();
    let mut b = loopback_host();
    let peer_a = a
        .connect(b.local_addr(), 1, CompressionLevel::Fast)
        .unwrap();

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |ea, eb| {
        connects(ea) >= 1 && connects(eb) >= 1
    })
    .await;

    let peer_b = events_b
        .iter()
        .find_map(|event| match event {
            Event::Connect { peer, .. } => Some(*peer),
            _ => None,
        })
        .expect("b saw the connect");
    (a, b, peer_a, peer_b)
}

/// A delayed close with traffic still queued drains every
/// message before the disconnect goes out - nothing is lost, and both sides
/// end with exactly one Disconnect event.
#[tokio::test]
async fn delayed_close_drains_queued_reliables_first() {
    let (mut a, mut b, peer_a, peer_b) = connected_pair().await;

    for value in 0u8..3 {
        a.send(peer_a, 0, Packet::reliable(vec![value; 64])).unwrap();
    }
    a.close(peer_a, CloseMode::Delayed).unwrap();
    assert_eq!(
        a.peer_state(peer_a).unwrap(),
        PeerState::DelayingDisconnect
    );

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |ea, eb| {
        disconnects(ea) >= 1 && disconnects(eb) >= 1
    })
    .await;

    // all three packets made it over before the teardown
    let received = received_payloads(&events_b);
    assert_eq!(received.len(), 3);
    for (value, payload) in received.iter().enumerate() {
        assert_eq!(*payload, &[value as u8; 64][..]);
    }

    assert_eq!(disconnects(&events_a), 1);
    assert_eq!(disconnects(&events_b), 1);
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Disconnected);
    assert_eq!(b.peer_state(peer_b).unwrap(), PeerState::Disconnected);
}

/// A graceful close with empty queues completes with a Disconnect on both
/// sides.
#[tokio::test]
async fn graceful_close_notifies_both_sides() {
    let (mut a, mut b, peer_a, _peer_b) = connected_pair().await;

    a.close(peer_a, CloseMode::Graceful).unwrap();
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Disconnecting);

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |ea, eb| {
        disconnects(ea) >= 1 && disconnects(eb) >= 1
    })
    .await;

    assert_eq!(disconnects(&events_a), 1);
    assert_eq!(disconnects(&events_b), 1);
}

/// An immediate close tears the local slot down without waiting for any
/// acknowledgement; the remote side still learns about it from the
/// best-effort disconnect message.
#[tokio::test]
async fn immediate_close_frees_the_slot_at_once() {
    let (mut a, mut b, peer_a, _peer_b) = connected_pair().await;

    a.close(peer_a, CloseMode::Immediate).unwrap();
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Disconnected);

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |_, eb| {
        disconnects(eb) >= 1
    })
    .await;
    assert_eq!(disconnects(&events_b), 1);
}
