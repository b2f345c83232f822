mod common;

use common::{connects, loopback_host, loopback_host_with, pump_until};
use xudp::{CompressionLevel, Event, HostConfig, PeerState};

/// A full handshake yields exactly one Connect event on each side, and both
/// sides end up holding the same session id and channel count.
#[tokio::test]
async fn connect_produces_one_connect_event_per_side() {
    let mut a = loopback_host();
    let mut b = loopback_host();

    let peer_a = a
        .connect(b.local_addr(), 2, CompressionLevel::Fast)
        .unwrap();
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Connecting);

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |ea, eb| {
        connects(ea) >= 1 && connects(eb) >= 1
    })
    .await;

    assert_eq!(connects(&events_a), 1);
    assert_eq!(connects(&events_b), 1);
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Connected);

    let peer_b = match &events_b[0] {
        Event::Connect { peer, .. } => *peer,
        other => panic!("expected a Connect event first, got {other:?}"),
    };
    assert_eq!(b.peer_state(peer_b).unwrap(), PeerState::Connected);
    assert_eq!(a.channel_count(peer_a).unwrap(), 2);
    assert_eq!(b.channel_count(peer_b).unwrap(), 2);
    assert_eq!(
        a.peer_session_id(peer_a).unwrap(),
        b.peer_session_id(peer_b).unwrap()
    );
}

/// The handshake and subsequent traffic also hold up with CRC32 checksums
/// standing in for the session id field.
#[tokio::test]
async fn handshake_works_with_checksums_enabled() {
    let config = || HostConfig {
        checksums: true,
        ..HostConfig::default()
    };
    let mut a = loopback_host_with(config());
    let mut b = loopback_host_with(config());

    let peer_a = a
        .connect(b.local_addr(), 1, CompressionLevel::Fast)
        .unwrap();

    let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut a, &mut b, &mut events_a, &mut events_b, |ea, eb| {
        connects(ea) >= 1 && connects(eb) >= 1
    })
    .await;

    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Connected);
}

/// A connect toward a host whose peer table is exhausted is silently
/// refused: the connecting side never sees a Connect event and eventually
/// times out.
#[tokio::test]
async fn full_server_refuses_silently() {
    let mut a = loopback_host();
    let mut b = loopback_host_with(HostConfig {
        max_peers: 1,
        ..HostConfig::default()
    });
    let mut c = loopback_host();

    // c occupies the only slot on b
    let _peer_c = c
        .connect(b.local_addr(), 1, CompressionLevel::Fast)
        .unwrap();
    let (mut events_c, mut events_b) = (Vec::new(), Vec::new());
    pump_until(&mut c, &mut b, &mut events_c, &mut events_b, |ec, eb| {
        connects(ec) >= 1 && connects(eb) >= 1
    })
    .await;

    let peer_a = a
        .connect(b.local_addr(), 1, CompressionLevel::Fast)
        .unwrap();
    let (mut events_a, mut more_events_b) = (Vec::new(), Vec::new());

    // give both sides a moment; no Connect may appear on either side
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(500);
    while tokio::time::Instant::now() < deadline {
        if let Some(event) = a
            .service(Some(std::time::Duration::from_millis(5)))
            .await
            .unwrap()
        {
            events_a.push(event);
        }
        if let Some(event) = b
            .service(Some(std::time::Duration::from_millis(5)))
            .await
            .unwrap()
        {
            more_events_b.push(event);
        }
    }
    assert_eq!(connects(&events_a), 0);
    assert_eq!(connects(&more_events_b), 0);
    assert_eq!(a.peer_state(peer_a).unwrap(), PeerState::Connecting);
}
