use std::net::SocketAddr;

use crate::host::PeerId;
use crate::packet::Packet;

/// What a service pass can yield to the application.
#[derive(Debug)]
pub enum Event {
    /// A handshake completed; the peer is now connected.
    Connect { peer: PeerId, endpoint: SocketAddr },

    /// A peer disconnected or timed out; its slot has been recycled.
    Disconnect { peer: PeerId, endpoint: SocketAddr },

    /// A payload is ready for the application, fully reassembled and in
    /// whatever order its delivery class guarantees.
    Receive {
        peer: PeerId,
        channel_id: u8,
        packet: Packet,
        sender: SocketAddr,
    },

    /// Another member announced itself on a joined multicast group.
    JoinMulticastGroup { peer: PeerId, endpoint: SocketAddr },

    /// A member announced it is leaving a joined multicast group.
    LeaveMulticastGroup { peer: PeerId, endpoint: SocketAddr },
}
