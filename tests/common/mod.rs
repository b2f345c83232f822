// not every test binary uses every helper
#![allow(dead_code)]

use std::time::Duration;

use tracing::Level;
use xudp::{Event, Host, HostConfig};

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

pub fn loopback_host() -> Host {
    loopback_host_with(HostConfig::default())
}

pub fn loopback_host_with(config: HostConfig) -> Host {
    Host::bind("127.0.0.1:0".parse().unwrap(), config).expect("bind loopback host")
}

/// Alternates servicing both hosts, collecting their events, until `done`
/// is satisfied. Panics when nothing converges within the deadline.
pub async fn pump_until(
    a: &mut Host,
    b: &mut Host,
    events_a: &mut Vec<Event>,
    events_b: &mut Vec<Event>,
    mut done: impl FnMut(&[Event], &[Event]) -> bool,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if done(events_a, events_b) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("test did not converge; a: {events_a:?}, b: {events_b:?}");
        }
        if let Some(event) = a.service(Some(Duration::from_millis(5))).await.unwrap() {
            events_a.push(event);
        }
        if let Some(event) = b.service(Some(Duration::from_millis(5))).await.unwrap() {
            events_b.push(event);
        }
    }
}

pub fn connects(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, Event::Connect { .. }))
        .count()
}

pub fn disconnects(events: &[Event]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, Event::Disconnect { .. }))
        .count()
}

pub fn received_payloads(events: &[Event]) -> Vec<&[u8]> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive { packet, .. } => Some(packet.data()),
            _ => None,
        })
        .collect()
}
