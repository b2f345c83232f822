//! XUDP is a connection-oriented transport protocol layered over plain UDP,
//! trading TCP's single totally-ordered byte stream for several independent
//! message lanes with per-message delivery guarantees.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *packets* (defined-length chunks
//!   of data), not streams of bytes.
//! * One socket, many peers: a host multiplexes up to a configured number of
//!   connections (and multicast-group memberships) over a single UDP port,
//!   addressing peers through a client id carried in every datagram.
//! * Four delivery classes, chosen per packet:
//!   * *reliable*: acknowledged, retransmitted with exponential backoff,
//!     delivered in order within its channel
//!   * *unreliable sequenced*: never retransmitted, delivered in order
//!     relative to other unreliable traffic on the channel; late arrivals
//!     are dropped
//!   * *unsequenced*: delivered in arrival order, deduplicated through a
//!     sliding group-id window
//!   * oversized reliable payloads are fragmented transparently and
//!     reassembled from any arrival order
//! * Multiple channels per peer, each with independent sequence spaces, so a
//!   stalled reliable transfer on one channel never blocks another.
//! * Congestion awareness without a congestion *protocol*: RTT movement
//!   drives a probabilistic send throttle for unreliable traffic, and the
//!   host periodically partitions its configured bandwidth fairly across
//!   peers, telling each one its share.
//! * A single-threaded, lock-free engine: all state belongs to the [`Host`]
//!   and is only touched from the thread driving [`Host::service`]. The one
//!   blocking point is a bounded wait for socket readability.
//! * Malformed, truncated, duplicated or replayed traffic is never an
//!   error: UDP promises nothing, so the engine drops protocol noise
//!   silently and reserves hard errors for socket faults, resource
//!   exhaustion and caller mistakes.
//!
//! ## Wire format
//!
//! Every datagram starts with a fixed header followed by up to 32 messages
//! packed back to back:
//!
//! ```ascii
//! header:   protocolId: u16 | version+flags: u8 | sessionId/checksum: u32
//!           | clientId: u16 | [sentTime: u16, only when flagged]
//! message:  type: u8 | channelId: u8 | flags: u8 | sequenceNumber: u16
//!           | fixed per-type fields | [payload bytes for data types]
//! ```
//!
//! All integers are network byte order. The session-id field doubles as a
//! CRC32 over the whole datagram when checksums are enabled. A receiver
//! walks the messages until fewer bytes remain than the next message needs,
//! discarding the rest as noise.
//!
//! ## Example
//!
//! ```no_run
//! use xudp::{CompressionLevel, Event, Host, HostConfig, Packet};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), xudp::XudpError> {
//!     let mut host = Host::bind("0.0.0.0:7100".parse().unwrap(), HostConfig::default())?;
//!     let _server = host.connect("203.0.113.7:7100".parse().unwrap(), 2, CompressionLevel::Fast)?;
//!
//!     loop {
//!         match host.service(Some(std::time::Duration::from_millis(100))).await? {
//!             Some(Event::Connect { peer, .. }) => {
//!                 host.send(peer, 0, Packet::reliable(&b"hello"[..]))?;
//!             }
//!             Some(Event::Receive { packet, .. }) => {
//!                 println!("got {} bytes", packet.len());
//!             }
//!             Some(_) | None => {}
//!         }
//!     }
//! }
//! ```

mod channel;
mod clock;
mod compress;
mod config;
mod error;
mod event;
mod host;
mod message;
mod packet;
mod packet_header;
mod peer;
mod sequence;

pub use compress::{CompressionLevel, Compressor};
pub use config::HostConfig;
pub use error::{DecodeError, Result, XudpError};
pub use event::Event;
pub use host::{Host, PeerId};
pub use packet::{Packet, PacketFlags};
pub use peer::{CloseMode, PeerState, ThrottleConfig};
