use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, IncomingMessage, Insertion};
use crate::clock::{time_lag, time_less, HostClock};
use crate::compress::{CompressionLevel, Compressor, ZstdCompressor};
use crate::config::{
    window_for_bandwidth, HostConfig, BANDWIDTH_THROTTLE_INTERVAL, DEFAULT_CHANNEL_COUNT,
    DEFAULT_POLL_SLICE, MAX_MTU, MAX_PACKET_SIZE, MAX_MESSAGES_PER_DATAGRAM, MAX_TIMEOUT,
    MAX_WINDOW_SIZE, MIN_MTU, MIN_TIMEOUT, MIN_WINDOW_SIZE, PACKET_THROTTLE_COUNTER_STEP,
    PACKET_THROTTLE_SCALE, PING_INTERVAL, PROTOCOL_TAG, RTO_LIMIT_FACTOR, WINDOW_SIZE_SCALE,
};
use crate::error::{Result, XudpError};
use crate::event::Event;
use crate::message::{
    ConnectBody, DataFragmentBody, Message, MessageBody, MessageFlags, MessageKind,
    ValidateConnectBody, CONTROL_CHANNEL_ID, MESSAGE_HEADER_LEN,
};
use crate::packet::{Packet, PacketFlags};
use crate::packet_header::{HeaderFlags, PacketHeader};
use crate::peer::{CloseMode, Peer, PeerState, QueueIncoming, ThrottleConfig};
use crate::sequence::{extend, hash16, is_stale};

/// Stable handle to a peer slot. Slots are recycled after a disconnect, so a
/// handle is only meaningful until the Disconnect event for its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u16);

impl PeerId {
    pub fn index(self) -> u16 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// What a message handler decided about one received message. An `Err` from
/// a handler aborts the whole receive pass instead.
enum Disposition {
    /// Dropped as noise; no acknowledgement owed.
    Discarded,
    /// Processed, possibly yielding an event; an acknowledgement is owed if
    /// the message asked for one.
    Handled(Option<Event>),
}

/// Messages staged for one outbound datagram, before the header is known.
struct OutboundDatagram {
    body: BytesMut,
    message_count: usize,
    header_flags: HeaderFlags,
}

impl OutboundDatagram {
    fn new(multicast: bool) -> OutboundDatagram {
        OutboundDatagram {
            body: BytesMut::new(),
            message_count: 0,
            header_flags: if multicast {
                HeaderFlags::MULTICAST
            } else {
                HeaderFlags::empty()
            },
        }
    }

    /// Bytes still available under the peer's MTU, header included.
    fn budget(&self, mtu: u16) -> usize {
        (mtu as usize).saturating_sub(PacketHeader::FULL_LEN + self.body.len())
    }
}

/// The protocol engine: one datagram socket multiplexed across a fixed table
/// of peers, driven by a single-threaded poll loop.
///
/// All state is owned by the `Host` and mutated only through `&mut self`;
/// there is no internal locking and no concurrency. The only suspension
/// point is the bounded wait for socket readability inside [`Host::service`].
pub struct Host {
    socket: UdpSocket,
    /// Duplicate of the socket's file descriptor kept in std form for
    /// multicast membership and TTL options.
    membership_socket: std::net::UdpSocket,
    local_addr: SocketAddr,
    protocol_id: u16,
    checksums: bool,
    default_mtu: u16,

    incoming_bandwidth: u32,
    outgoing_bandwidth: u32,
    reconfigure_bandwidth: bool,
    bandwidth_throttle_epoch: u32,

    clock: HostClock,
    current_time: u32,

    peers: Vec<Peer>,
    last_serviced: usize,
}

impl Host {
    /// Binds a host to a local endpoint.
    ///
    /// Must be called within a tokio runtime. The socket is non-blocking
    /// from the start; a full send buffer drops datagrams the way the
    /// network would instead of blocking the loop.
    pub fn bind(addr: SocketAddr, config: HostConfig) -> Result<Host> {
        config.validate()?;

        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        if addr.is_ipv4() {
            std_socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        }
        let membership_socket = std_socket.try_clone()?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;
        info!("bound host socket to {:?}", local_addr);

        let peers = (0..config.max_peers)
            .map(|index| Peer::new(index, config.mtu))
            .collect();

        Ok(Host {
            socket,
            membership_socket,
            local_addr,
            protocol_id: hash16(PROTOCOL_TAG),
            checksums: config.checksums,
            default_mtu: config.mtu,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            reconfigure_bandwidth: false,
            bandwidth_throttle_epoch: 0,
            clock: HostClock::new(),
            current_time: 0,
            peers,
            last_serviced: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn max_peers(&self) -> u16 {
        self.peers.len() as u16
    }

    pub fn incoming_bandwidth(&self) -> u32 {
        self.incoming_bandwidth
    }

    pub fn outgoing_bandwidth(&self) -> u32 {
        self.outgoing_bandwidth
    }

    pub fn set_incoming_bandwidth(&mut self, bandwidth: u32) {
        self.incoming_bandwidth = bandwidth;
        self.reconfigure_bandwidth = true;
    }

    pub fn set_outgoing_bandwidth(&mut self, bandwidth: u32) {
        self.outgoing_bandwidth = bandwidth;
        self.reconfigure_bandwidth = true;
    }

    pub fn peer_state(&self, peer: PeerId) -> Result<PeerState> {
        Ok(self.peer(peer)?.state)
    }

    pub fn peer_endpoint(&self, peer: PeerId) -> Result<Option<SocketAddr>> {
        Ok(self.peer(peer)?.remote_endpoint)
    }

    pub fn channel_count(&self, peer: PeerId) -> Result<u8> {
        Ok(self.peer(peer)?.channel_count())
    }

    /// The 32-bit session token negotiated for this connection; both sides
    /// of an established connection hold the same value.
    pub fn peer_session_id(&self, peer: PeerId) -> Result<u32> {
        Ok(self.peer(peer)?.session_id)
    }

    pub fn is_multicast_member(&self, peer: PeerId) -> Result<bool> {
        Ok(self.peer(peer)?.is_multicast_member)
    }

    pub fn throttle_configuration(&self, peer: PeerId) -> Result<ThrottleConfig> {
        Ok(self.peer(peer)?.throttle)
    }

    /// Applies a new throttle configuration locally and announces it to the
    /// remote side.
    pub fn configure_throttle(&mut self, peer: PeerId, throttle: ThrottleConfig) -> Result<()> {
        let index = self.peer_index(peer)?;
        let peer = &mut self.peers[index];
        peer.throttle = throttle;

        let flags = if peer.is_multicast_member {
            MessageFlags::UNSEQUENCED
        } else {
            MessageFlags::ACKNOWLEDGE
        };
        let message = Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags,
            sequence_number: 0,
            body: MessageBody::ConfigureThrottle {
                interval: throttle.interval,
                acceleration: throttle.acceleration,
                deceleration: throttle.deceleration,
            },
        };
        peer.queue_outgoing(message, None, 0, 0);
        Ok(())
    }

    /// Initiates an outbound connection. The returned peer is `Connecting`;
    /// a Connect event arrives once the handshake completes.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        channel_count: u8,
        compression: CompressionLevel,
    ) -> Result<PeerId> {
        if is_multicast_address(remote.ip()) {
            return Err(XudpError::InvalidArgument(
                "use join_multicast_group for multicast endpoints",
            ));
        }
        let channel_count = if channel_count == 0 {
            DEFAULT_CHANNEL_COUNT
        } else {
            channel_count
        };

        let index = self
            .free_slot()
            .ok_or(XudpError::PeerLimitReached(self.peers.len() as u16))?;

        let incoming_bandwidth = self.incoming_bandwidth;
        let outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connecting;
        peer.remote_endpoint = Some(remote);
        peer.is_multicast_member = false;
        peer.session_id = rand::random();
        peer.compression_level = Some(compression);
        peer.window_size = window_for_bandwidth(outgoing_bandwidth);

        let message = Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 0,
            body: MessageBody::Connect(ConnectBody {
                client_id: peer.index,
                session_id: peer.session_id,
                channel_count,
                mtu: peer.mtu,
                window_size: peer.window_size,
                incoming_bandwidth,
                outgoing_bandwidth,
                throttle_interval: peer.throttle.interval,
                throttle_acceleration: peer.throttle.acceleration,
                throttle_deceleration: peer.throttle.deceleration,
                compression_level: compression.to_wire(),
            }),
        };
        peer.queue_outgoing(message, None, 0, 0);

        debug!("connecting to {:?} with {} channels", remote, channel_count);
        Ok(PeerId(index as u16))
    }

    /// Joins a multicast group, skipping the connect handshake entirely: the
    /// returned peer is `Connected` at once and announces itself to the
    /// group with a join message.
    ///
    /// The OS-level group membership is only acquired when the group port
    /// matches the local port; otherwise this host can send to the group but
    /// will not receive from it. IPv4 interface selection by index is not
    /// supported; pass 0 for the default interface.
    pub fn join_multicast_group(
        &mut self,
        group: SocketAddr,
        interface_index: u32,
        ttl: u32,
        channel_count: u8,
    ) -> Result<PeerId> {
        if !is_multicast_address(group.ip()) {
            return Err(XudpError::InvalidArgument("not a multicast endpoint"));
        }
        let channel_count = if channel_count == 0 {
            DEFAULT_CHANNEL_COUNT
        } else {
            channel_count
        };

        for peer in &self.peers {
            if peer.state == PeerState::Connected
                && peer.is_multicast_member
                && peer.multicast_interface == interface_index
                && peer.remote_endpoint == Some(group)
            {
                return Err(XudpError::MulticastGroupAlreadyJoined);
            }
        }

        let index = self
            .free_slot()
            .ok_or(XudpError::PeerLimitReached(self.peers.len() as u16))?;

        if group.port() == self.local_addr.port() {
            match group.ip() {
                IpAddr::V4(address) => {
                    if interface_index != 0 {
                        return Err(XudpError::Unsupported(
                            "IPv4 interface selection by index",
                        ));
                    }
                    self.membership_socket.set_multicast_ttl_v4(ttl)?;
                    self.membership_socket
                        .join_multicast_v4(&address, &Ipv4Addr::UNSPECIFIED)?;
                }
                IpAddr::V6(address) => {
                    self.membership_socket
                        .join_multicast_v6(&address, interface_index)?;
                }
            }
        }

        // the group id is a 16-bit hash of the group endpoint's textual form,
        // shared by every member addressing the group
        let group_id = hash16(&format!("{}:{:x}", group.ip(), group.port()));

        let outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer.state = PeerState::Connected;
        peer.remote_client_id = group_id;
        peer.remote_endpoint = Some(group);
        peer.is_multicast_member = true;
        peer.multicast_interface = interface_index;
        peer.compression_level = Some(CompressionLevel::Fast);
        peer.window_size = window_for_bandwidth(outgoing_bandwidth);

        let message = Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags: MessageFlags::UNSEQUENCED,
            sequence_number: 0,
            body: MessageBody::JoinMulticastGroup,
        };
        peer.queue_outgoing(message, None, 0, 0);

        debug!("joined multicast group {:?} as client id {}", group, group_id);
        Ok(PeerId(index as u16))
    }

    /// Queues a packet for delivery on one of the peer's channels.
    pub fn send(&mut self, peer: PeerId, channel_id: u8, packet: Packet) -> Result<()> {
        let index = self.peer_index(peer)?;
        {
            let peer = &self.peers[index];
            if packet.len() > MAX_PACKET_SIZE {
                return Err(XudpError::PacketTooLarge(packet.len()));
            }
            if channel_id as usize >= peer.channels.len() {
                return Err(XudpError::InvalidChannel {
                    channel: channel_id,
                    channel_count: peer.channel_count(),
                });
            }
            if peer.state != PeerState::Connected {
                return Err(XudpError::NotConnected);
            }
            if peer.is_multicast_member && packet.flags().contains(PacketFlags::RELIABLE) {
                return Err(XudpError::Unsupported(
                    "reliable data cannot be multicast",
                ));
            }
        }

        let mut packet = packet;
        let mut compressed = false;
        if packet.flags().contains(PacketFlags::COMPRESSED) {
            let codec = self.compressor_for(index)?;
            let deflated = codec.deflate(packet.data())?;
            if deflated.len() < packet.len() {
                let flags = packet.flags();
                packet = Packet::new(deflated, flags);
                compressed = true;
            } else {
                // incompressible; send as-is
                let mut flags = packet.flags();
                flags.remove(PacketFlags::COMPRESSED);
                packet.set_flags(flags);
            }
        }

        let peer = &mut self.peers[index];
        let fragment_capacity =
            peer.mtu as usize - PacketHeader::FULL_LEN - MessageKind::DataFragment.wire_len();
        if packet.len() > fragment_capacity && peer.is_multicast_member {
            // fragments are always reliable
            return Err(XudpError::Unsupported(
                "oversized packets cannot be multicast",
            ));
        }

        peer.queue_packet(channel_id, packet, compressed);
        Ok(())
    }

    /// Queues a packet to every connected peer. The payload buffer is shared
    /// across all queues, not copied per peer.
    pub fn broadcast(&mut self, channel_id: u8, packet: Packet) -> Result<()> {
        for index in 0..self.peers.len() {
            if self.peers[index].state != PeerState::Connected {
                continue;
            }
            self.send(PeerId(index as u16), channel_id, packet.clone())?;
        }
        Ok(())
    }

    /// Takes the next deliverable packet from one of the peer's channels,
    /// bypassing the event loop.
    pub fn receive(
        &mut self,
        peer: PeerId,
        channel_id: u8,
    ) -> Result<Option<(Packet, SocketAddr)>> {
        let index = self.peer_index(peer)?;
        let peer = &mut self.peers[index];
        if channel_id as usize >= peer.channels.len() {
            return Err(XudpError::InvalidChannel {
                channel: channel_id,
                channel_count: peer.channel_count(),
            });
        }
        let is_multicast = peer.is_multicast_member;
        match peer.channels[channel_id as usize].take_deliverable(is_multicast) {
            Some(message) => self.deliver(index, message).map(Some),
            None => Ok(None),
        }
    }

    /// Queues a keep-alive probe; its acknowledgement refreshes the RTT
    /// estimate.
    pub fn ping(&mut self, peer: PeerId) -> Result<()> {
        let index = self.peer_index(peer)?;
        let peer = &mut self.peers[index];
        if peer.state != PeerState::Connected {
            return Err(XudpError::NotConnected);
        }
        if peer.is_multicast_member {
            return Err(XudpError::Unsupported("multicast members are not pinged"));
        }
        peer.queue_ping();
        Ok(())
    }

    /// Closes a connection or leaves a multicast group.
    pub fn close(&mut self, peer: PeerId, mode: CloseMode) -> Result<()> {
        let index = self.peer_index(peer)?;
        match mode {
            CloseMode::Graceful => self.close_gracefully(index),
            CloseMode::Delayed => self.close_later(index),
            CloseMode::Immediate => self.close_now(index),
        }
    }

    /// Forces an immediate send pass for everything queued.
    pub fn flush(&mut self) -> Result<()> {
        self.current_time = self.clock.now_millis();
        self.send_outgoing(false)?;
        Ok(())
    }

    /// One iteration of the engine: dispatches pending internal events, runs
    /// periodic work, drains outbound queues, pulls in whatever datagrams
    /// are ready, and otherwise waits for socket readability.
    ///
    /// `Some(Duration::ZERO)` polls without blocking, `Some(d)` waits at
    /// most `d` for an event, `None` blocks indefinitely while still
    /// servicing periodic work every [`DEFAULT_POLL_SLICE`].
    pub async fn service(&mut self, timeout: Option<Duration>) -> Result<Option<Event>> {
        if let Some(event) = self.dispatch_event()? {
            return Ok(Some(event));
        }

        self.current_time = self.clock.now_millis();
        let deadline =
            timeout.map(|t| self.current_time.wrapping_add(t.as_millis() as u32));

        loop {
            if time_lag(self.current_time, self.bandwidth_throttle_epoch)
                >= BANDWIDTH_THROTTLE_INTERVAL
            {
                self.throttle_bandwidth();
            }

            if let Some(event) = self.send_outgoing(true)? {
                return Ok(Some(event));
            }
            if let Some(event) = self.receive_incoming()? {
                return Ok(Some(event));
            }
            if let Some(event) = self.send_outgoing(true)? {
                return Ok(Some(event));
            }
            if let Some(event) = self.dispatch_event()? {
                return Ok(Some(event));
            }

            self.current_time = self.clock.now_millis();

            let wait = match deadline {
                Some(deadline) => {
                    if !time_less(self.current_time, deadline) {
                        return Ok(None);
                    }
                    Duration::from_millis(u64::from(time_lag(deadline, self.current_time)))
                }
                None => DEFAULT_POLL_SLICE,
            };

            match tokio::time::timeout(wait, self.socket.readable()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    if deadline.is_some() {
                        return Ok(None);
                    }
                    // no deadline: keep looping for periodic work
                }
            }
            self.current_time = self.clock.now_millis();
        }
    }

    fn peer_index(&self, peer: PeerId) -> Result<usize> {
        if (peer.0 as usize) < self.peers.len() {
            Ok(peer.0 as usize)
        } else {
            Err(XudpError::InvalidArgument("unknown peer id"))
        }
    }

    fn peer(&self, peer: PeerId) -> Result<&Peer> {
        self.peer_index(peer).map(|index| &self.peers[index])
    }

    fn free_slot(&self) -> Option<usize> {
        self.peers
            .iter()
            .position(|peer| peer.state == PeerState::Disconnected)
    }

    /// Compression handles are shared: a peer without one first borrows from
    /// any peer that already negotiated the same level.
    fn compressor_for(&mut self, index: usize) -> Result<Arc<dyn Compressor>> {
        if let Some(codec) = &self.peers[index].compressor {
            return Ok(codec.clone());
        }
        let level = self.peers[index]
            .compression_level
            .ok_or(XudpError::NotConnected)?;
        let codec = self
            .peers
            .iter()
            .find_map(|peer| {
                peer.compressor
                    .as_ref()
                    .filter(|codec| codec.level() == level)
                    .cloned()
            })
            .unwrap_or_else(|| ZstdCompressor::shared(level));
        self.peers[index].compressor = Some(codec.clone());
        Ok(codec)
    }

    /// Turns a deliverable queue entry into an application packet, inflating
    /// compressed payloads.
    fn deliver(
        &mut self,
        index: usize,
        message: IncomingMessage,
    ) -> Result<(Packet, SocketAddr)> {
        let flags = match message.kind {
            MessageKind::ReliableData | MessageKind::DataFragment => PacketFlags::RELIABLE,
            MessageKind::UnsequencedData => PacketFlags::UNSEQUENCED,
            _ => PacketFlags::empty(),
        };
        let mut data: Bytes = message.data.freeze();
        if message.flags.contains(MessageFlags::COMPRESSED) {
            let codec = self.compressor_for(index)?;
            data = Bytes::from(codec.inflate(&data)?);
        }
        Ok((Packet::new(data, flags), message.sender))
    }

    /// Recycles a peer slot, releasing the OS-level multicast membership if
    /// this peer carried it.
    fn reset_peer(&mut self, index: usize) {
        let peer = &self.peers[index];
        if peer.is_multicast_member {
            if let Some(endpoint) = peer.remote_endpoint {
                if endpoint.port() == self.local_addr.port() {
                    let result = match endpoint.ip() {
                        IpAddr::V4(address) => self
                            .membership_socket
                            .leave_multicast_v4(&address, &Ipv4Addr::UNSPECIFIED),
                        IpAddr::V6(address) => self
                            .membership_socket
                            .leave_multicast_v6(&address, peer.multicast_interface),
                    };
                    if let Err(e) = result {
                        debug!("failed to leave multicast group {:?}: {}", endpoint, e);
                    }
                }
            }
        }
        let mtu = self.default_mtu;
        self.peers[index].reset(mtu);
    }

    fn close_gracefully(&mut self, index: usize) -> Result<()> {
        let state = self.peers[index].state;
        if matches!(
            state,
            PeerState::Disconnecting | PeerState::Disconnected | PeerState::Zombie
        ) {
            return Err(XudpError::NotConnected);
        }

        let peer = &mut self.peers[index];
        peer.clear_queues();

        if peer.is_multicast_member {
            let message = Message {
                channel_id: CONTROL_CHANNEL_ID,
                flags: MessageFlags::UNSEQUENCED,
                sequence_number: 0,
                body: MessageBody::LeaveMulticastGroup,
            };
            peer.queue_outgoing(message, None, 0, 0);
        } else {
            let established = matches!(
                state,
                PeerState::Connected | PeerState::DelayingDisconnect
            );
            let flags = if established {
                MessageFlags::ACKNOWLEDGE
            } else {
                MessageFlags::UNSEQUENCED
            };
            let message = Message {
                channel_id: CONTROL_CHANNEL_ID,
                flags,
                sequence_number: 0,
                body: MessageBody::Disconnect,
            };
            peer.queue_outgoing(message, None, 0, 0);

            if established {
                // teardown completes when the disconnect is acknowledged
                peer.state = PeerState::Disconnecting;
                return Ok(());
            }
        }

        self.flush()?;
        self.reset_peer(index);
        Ok(())
    }

    fn close_later(&mut self, index: usize) -> Result<()> {
        let peer = &self.peers[index];
        let draining = !peer.outgoing_reliable.is_empty()
            || !peer.outgoing_unreliable.is_empty()
            || !peer.sent_reliable.is_empty();
        if matches!(
            peer.state,
            PeerState::Connected | PeerState::DelayingDisconnect
        ) && draining
        {
            self.peers[index].state = PeerState::DelayingDisconnect;
            Ok(())
        } else {
            self.close_gracefully(index)
        }
    }

    fn close_now(&mut self, index: usize) -> Result<()> {
        let state = self.peers[index].state;
        if state == PeerState::Disconnected {
            return Err(XudpError::NotConnected);
        }
        if state != PeerState::Zombie && state != PeerState::Disconnecting {
            let peer = &mut self.peers[index];
            peer.clear_queues();
            let body = if peer.is_multicast_member {
                MessageBody::LeaveMulticastGroup
            } else {
                MessageBody::Disconnect
            };
            let message = Message {
                channel_id: CONTROL_CHANNEL_ID,
                flags: MessageFlags::UNSEQUENCED,
                sequence_number: 0,
                body,
            };
            peer.queue_outgoing(message, None, 0, 0);
            self.flush()?;
        }
        self.reset_peer(index);
        Ok(())
    }

    /// Serves queued internal events round-robin, starting after the peer
    /// serviced last.
    fn dispatch_event(&mut self) -> Result<Option<Event>> {
        if self.peers.is_empty() {
            return Ok(None);
        }
        let count = self.peers.len();
        let start = self.last_serviced % count;
        let mut index = start;

        loop {
            index = (index + 1) % count;

            match self.peers[index].state {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    self.peers[index].state = PeerState::Connected;
                    let endpoint = self.peers[index]
                        .remote_endpoint
                        .expect("a handshaking peer has a remote endpoint");
                    return Ok(Some(Event::Connect {
                        peer: PeerId(index as u16),
                        endpoint,
                    }));
                }
                PeerState::Zombie => {
                    self.reconfigure_bandwidth = true;
                    let endpoint = self.peers[index]
                        .remote_endpoint
                        .expect("a zombie peer has a remote endpoint");
                    self.reset_peer(index);
                    self.last_serviced = index;
                    return Ok(Some(Event::Disconnect {
                        peer: PeerId(index as u16),
                        endpoint,
                    }));
                }
                PeerState::Connected => {
                    let is_multicast = self.peers[index].is_multicast_member;
                    for channel_id in 0..self.peers[index].channels.len() {
                        let message = self.peers[index].channels[channel_id]
                            .take_deliverable(is_multicast);
                        let Some(message) = message else { continue };
                        let (packet, sender) = self.deliver(index, message)?;
                        self.last_serviced = index;
                        return Ok(Some(Event::Receive {
                            peer: PeerId(index as u16),
                            channel_id: channel_id as u8,
                            packet,
                            sender,
                        }));
                    }
                }
                _ => {}
            }

            if index == start {
                break;
            }
        }
        Ok(None)
    }

    /// Drains every peer's outbound queues into datagrams. Peers with more
    /// pending traffic than one datagram can hold get additional rounds
    /// until everything fits or windows close.
    fn send_outgoing(&mut self, check_timeouts: bool) -> Result<Option<Event>> {
        let mut continue_sending = true;
        while continue_sending {
            continue_sending = false;

            for index in 0..self.peers.len() {
                if matches!(
                    self.peers[index].state,
                    PeerState::Disconnected | PeerState::Zombie
                ) {
                    continue;
                }

                let current_time = self.current_time;
                let mut datagram =
                    OutboundDatagram::new(self.peers[index].is_multicast_member);

                {
                    let peer = &mut self.peers[index];
                    if !peer.acknowledgements.is_empty() {
                        continue_sending |= stage_acknowledgements(peer, &mut datagram);
                    }
                }

                if check_timeouts {
                    let overdue = {
                        let peer = &self.peers[index];
                        !peer.sent_reliable.is_empty()
                            && !time_less(current_time, peer.next_timeout)
                    };
                    if overdue {
                        if let Some(event) = self.check_for_timeouts(index)? {
                            return Ok(Some(event));
                        }
                    }
                }

                {
                    let peer = &mut self.peers[index];
                    if peer.state == PeerState::Disconnected {
                        // torn down by the timeout check
                        continue;
                    }
                    if !peer.outgoing_reliable.is_empty() {
                        continue_sending |=
                            stage_reliable(peer, &mut datagram, current_time);
                    } else if peer.sent_reliable.is_empty()
                        && peer.state == PeerState::Connected
                        && !peer.is_multicast_member
                        && time_lag(current_time, peer.last_receive_time) >= PING_INTERVAL
                        && datagram.budget(peer.mtu) >= MessageKind::Ping.wire_len()
                    {
                        peer.queue_ping();
                        continue_sending |=
                            stage_reliable(peer, &mut datagram, current_time);
                    }
                    if !peer.outgoing_unreliable.is_empty() {
                        continue_sending |= stage_unreliable(peer, &mut datagram);
                    }
                }

                let drained = {
                    let peer = &self.peers[index];
                    peer.state == PeerState::DelayingDisconnect
                        && peer.outgoing_reliable.is_empty()
                        && peer.outgoing_unreliable.is_empty()
                        && peer.sent_reliable.is_empty()
                };
                if drained {
                    self.close_gracefully(index)?;
                }

                if datagram.message_count == 0 {
                    continue;
                }
                self.finish_and_send(index, datagram)?;
                self.peers[index].sent_unreliable.clear();
            }
        }
        Ok(None)
    }

    /// Prepends the header, drops in the checksum and hands the datagram to
    /// the socket. A full send buffer drops the datagram like the network
    /// would.
    fn finish_and_send(&mut self, index: usize, datagram: OutboundDatagram) -> Result<()> {
        let peer = &self.peers[index];
        let Some(endpoint) = peer.remote_endpoint else {
            return Ok(());
        };

        let header = PacketHeader {
            flags: datagram.header_flags,
            session_id: peer.session_id,
            client_id: peer.remote_client_id,
            sent_time: datagram
                .header_flags
                .contains(HeaderFlags::SENT_TIME)
                .then_some((self.current_time & 0xFFFF) as u16),
        };

        let mut out = BytesMut::with_capacity(header.serialized_len() + datagram.body.len());
        header.ser(self.protocol_id, &mut out);
        out.extend_from_slice(&datagram.body);

        if self.checksums {
            let checksum = PacketHeader::checksum_with_session_id(&out, peer.session_id);
            PacketHeader::patch_session_id(&mut out, checksum);
        }

        trace!(
            "sending {} bytes, {} messages to {:?}",
            out.len(),
            datagram.message_count,
            endpoint
        );
        match self.socket.try_send_to(&out, endpoint) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("send buffer full, dropping datagram to {:?}", endpoint);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Retransmission check for a peer whose earliest pending-ack message is
    /// overdue: overdue messages double their RTO and move to the front of
    /// the outgoing queue; a peer past the timeout ceilings is declared dead.
    fn check_for_timeouts(&mut self, index: usize) -> Result<Option<Event>> {
        let current_time = self.current_time;
        let mut timed_out = false;

        {
            let peer = &mut self.peers[index];
            let mut position = 0;
            while position < peer.sent_reliable.len() {
                if time_lag(current_time, peer.sent_reliable[position].sent_time)
                    < peer.sent_reliable[position].rto
                {
                    position += 1;
                    continue;
                }

                let sent_time = peer.sent_reliable[position].sent_time;
                if peer.earliest_timeout == 0 || time_less(sent_time, peer.earliest_timeout) {
                    peer.earliest_timeout = sent_time;
                }
                if peer.earliest_timeout != 0 {
                    let unacked_age = time_lag(current_time, peer.earliest_timeout);
                    let rto_exhausted = peer.sent_reliable[position].rto
                        >= peer.sent_reliable[position].rto_limit;
                    if unacked_age >= MAX_TIMEOUT
                        || (rto_exhausted && unacked_age >= MIN_TIMEOUT)
                    {
                        timed_out = true;
                        break;
                    }
                }

                let Some(mut message) = peer.sent_reliable.remove(position) else {
                    break;
                };
                if message.packet.is_some() {
                    peer.reliable_data_in_transit -= u32::from(message.fragment_length);
                }
                message.rto *= 2;
                trace!(
                    "retransmitting sequence number {} on channel {}",
                    message.reliable_seq,
                    message.message.channel_id
                );
                peer.outgoing_reliable.push_front(message);
            }

            if !timed_out {
                if let Some(head) = peer.sent_reliable.front() {
                    peer.next_timeout = head.sent_time.wrapping_add(head.rto);
                }
            }
        }

        if timed_out {
            debug!(
                "peer {} exceeded the retry ceiling, disconnecting",
                PeerId(index as u16)
            );
            return Ok(self.notify_disconnect(index, true));
        }
        Ok(None)
    }

    fn notify_connect(&mut self, index: usize, allow_event: bool) -> Option<Event> {
        self.reconfigure_bandwidth = true;
        let peer = &mut self.peers[index];
        if allow_event {
            peer.state = PeerState::Connected;
            let endpoint = peer
                .remote_endpoint
                .expect("a handshaking peer has a remote endpoint");
            Some(Event::Connect {
                peer: PeerId(index as u16),
                endpoint,
            })
        } else {
            // stage the state so the next dispatch pass emits the event
            peer.state = if peer.state == PeerState::Connecting {
                PeerState::ConnectionSucceeded
            } else {
                PeerState::ConnectionPending
            };
            None
        }
    }

    fn notify_disconnect(&mut self, index: usize, allow_event: bool) -> Option<Event> {
        let state = self.peers[index].state;
        if state >= PeerState::ConnectionPending {
            self.reconfigure_bandwidth = true;
        }

        if state != PeerState::Connecting && state < PeerState::ConnectionSucceeded {
            // the handshake never completed; nothing to tell the application
            self.reset_peer(index);
            None
        } else if !allow_event {
            self.peers[index].state = PeerState::Zombie;
            None
        } else {
            let endpoint = self.peers[index]
                .remote_endpoint
                .expect("a connected peer has a remote endpoint");
            self.reset_peer(index);
            Some(Event::Disconnect {
                peer: PeerId(index as u16),
                endpoint,
            })
        }
    }

    /// Pulls in every datagram the socket has ready, without blocking.
    fn receive_incoming(&mut self) -> Result<Option<Event>> {
        let mut buffer = [0u8; MAX_MTU as usize];
        loop {
            let (length, sender) = match self.socket.try_recv_from(&mut buffer) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(event) = self.process_datagram(&buffer[..length], sender)? {
                return Ok(Some(event));
            }
        }
    }

    /// Routes one datagram to a peer and walks the messages packed into it.
    /// Anything that does not parse as protocol traffic is dropped silently.
    fn process_datagram(&mut self, datagram: &[u8], sender: SocketAddr) -> Result<Option<Event>> {
        let mut rest: &[u8] = datagram;
        let header = match PacketHeader::deser(&mut rest, self.protocol_id) {
            Ok(header) => header,
            Err(e) => {
                trace!("dropping datagram from {:?}: {}", sender, e);
                return Ok(None);
            }
        };

        let mut peer_index: Option<usize> = None;
        if header.client_id == PacketHeader::UNASSIGNED_CLIENT_ID
            && !header.flags.contains(HeaderFlags::MULTICAST)
        {
            // a connect not yet bound to a slot; the connect handler routes it
        } else if header.flags.contains(HeaderFlags::MULTICAST) {
            match self.peers.iter().position(|peer| {
                peer.is_multicast_member && peer.remote_client_id == header.client_id
            }) {
                Some(index) => peer_index = Some(index),
                None => {
                    trace!("datagram for unknown multicast group {}", header.client_id);
                    return Ok(None);
                }
            }
        } else if (header.client_id as usize) < self.peers.len() {
            let index = header.client_id as usize;
            let peer = &self.peers[index];
            if matches!(peer.state, PeerState::Disconnected | PeerState::Zombie) {
                return Ok(None);
            }
            match peer.remote_endpoint {
                Some(endpoint) if endpoint.ip() == sender.ip() => {}
                _ => {
                    debug!(
                        "datagram for {} from unexpected sender {:?}",
                        PeerId(index as u16),
                        sender
                    );
                    return Ok(None);
                }
            }
            peer_index = Some(index);
        } else {
            return Ok(None);
        }

        if let Some(index) = peer_index {
            let expected_session = self.peers[index].session_id;
            if self.checksums {
                let computed =
                    PacketHeader::checksum_with_session_id(datagram, expected_session);
                if computed != header.session_id {
                    debug!("checksum mismatch on datagram from {:?}", sender);
                    return Ok(None);
                }
            } else if header.session_id != expected_session {
                return Ok(None);
            }
            let peer = &mut self.peers[index];
            peer.incoming_data_total =
                peer.incoming_data_total.wrapping_add(datagram.len() as u32);
        }

        let mut event: Option<Event> = None;

        while rest.len() >= MESSAGE_HEADER_LEN {
            let mut reader = rest;
            let message = match Message::deser(&mut reader) {
                Ok(message) => message,
                Err(e) => {
                    trace!("abandoning datagram tail from {:?}: {}", sender, e);
                    break;
                }
            };

            if peer_index.is_none() && message.kind() != MessageKind::Connect {
                trace!("non-connect message without a peer from {:?}", sender);
                break;
            }

            let payload = match message.body.payload_len() {
                Some(length) => {
                    let length = length as usize;
                    if reader.len() < length {
                        trace!("declared payload overruns the datagram from {:?}", sender);
                        rest = &[];
                        break;
                    }
                    let payload = &reader[..length];
                    rest = &reader[length..];
                    Some(payload)
                }
                None => {
                    rest = reader;
                    None
                }
            };

            let disposition = self.handle_message(
                &mut peer_index,
                &header,
                &message,
                payload,
                sender,
                event.is_none(),
                datagram,
            )?;

            match disposition {
                Disposition::Discarded => continue,
                Disposition::Handled(new_event) => {
                    if let Some(new_event) = new_event {
                        event = Some(new_event);
                    }
                    self.maybe_queue_acknowledgement(peer_index, &header, &message);
                }
            }
        }

        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_message(
        &mut self,
        peer_index: &mut Option<usize>,
        header: &PacketHeader,
        message: &Message,
        payload: Option<&[u8]>,
        sender: SocketAddr,
        allow_event: bool,
        datagram: &[u8],
    ) -> Result<Disposition> {
        if let MessageBody::Connect(body) = &message.body {
            return self.on_connect(peer_index, header, body, sender, datagram);
        }
        let Some(index) = *peer_index else {
            return Ok(Disposition::Discarded);
        };

        match &message.body {
            MessageBody::Acknowledge { .. } => self.on_acknowledge(index, message, allow_event),
            MessageBody::ValidateConnect(body) => {
                self.on_validate_connect(index, body, allow_event)
            }
            MessageBody::Disconnect => self.on_disconnect(index, message),
            MessageBody::JoinMulticastGroup => {
                Ok(Disposition::Handled(allow_event.then_some(
                    Event::JoinMulticastGroup {
                        peer: PeerId(index as u16),
                        endpoint: sender,
                    },
                )))
            }
            MessageBody::LeaveMulticastGroup => {
                Ok(Disposition::Handled(allow_event.then_some(
                    Event::LeaveMulticastGroup {
                        peer: PeerId(index as u16),
                        endpoint: sender,
                    },
                )))
            }
            MessageBody::Ping => Ok(Disposition::Handled(None)),
            MessageBody::ReliableData { .. }
            | MessageBody::UnreliableData { .. }
            | MessageBody::UnsequencedData { .. } => {
                self.on_data(index, message, payload.unwrap_or(&[]), sender)
            }
            MessageBody::DataFragment(body) => {
                self.on_data_fragment(index, message, body, payload.unwrap_or(&[]), sender)
            }
            MessageBody::ConfigureBandwidth {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => self.on_configure_bandwidth(index, *incoming_bandwidth, *outgoing_bandwidth),
            MessageBody::ConfigureThrottle {
                interval,
                acceleration,
                deceleration,
            } => {
                self.peers[index].throttle = ThrottleConfig {
                    interval: *interval,
                    acceleration: *acceleration,
                    deceleration: *deceleration,
                };
                Ok(Disposition::Handled(None))
            }
            MessageBody::Connect(_) => unreachable!("handled above"),
        }
    }

    /// Sends back an acknowledgement for a handled message that asked for
    /// one, unless the peer's state forbids it.
    fn maybe_queue_acknowledgement(
        &mut self,
        peer_index: Option<usize>,
        header: &PacketHeader,
        message: &Message,
    ) {
        let Some(index) = peer_index else { return };
        if !message.flags.contains(MessageFlags::ACKNOWLEDGE) {
            return;
        }
        let Some(sent_time) = header.sent_time else { return };

        let peer = &mut self.peers[index];
        match peer.state {
            PeerState::Disconnecting | PeerState::AcknowledgingConnect => {}
            PeerState::AcknowledgingDisconnect => {
                if message.kind() == MessageKind::Disconnect {
                    peer.queue_acknowledgement(message, sent_time);
                }
            }
            // the handler tore the peer down while processing this message
            PeerState::Disconnected => {}
            _ => peer.queue_acknowledgement(message, sent_time),
        }
    }

    fn on_acknowledge(
        &mut self,
        index: usize,
        message: &Message,
        allow_event: bool,
    ) -> Result<Disposition> {
        let MessageBody::Acknowledge {
            received_sequence_number,
            received_sent_time,
        } = message.body
        else {
            return Ok(Disposition::Discarded);
        };

        let current_time = self.current_time;

        // reconstruct the full 32-bit send time from its echoed low half
        let mut sent_time = u32::from(received_sent_time) | (current_time & 0xFFFF_0000);
        if (sent_time & 0x8000) > (current_time & 0x8000) {
            sent_time = sent_time.wrapping_sub(0x10000);
        }
        if time_less(current_time, sent_time) {
            // claims to answer a message we have not sent yet
            return Ok(Disposition::Handled(None));
        }

        {
            let peer = &mut self.peers[index];
            peer.last_receive_time = current_time;
            peer.earliest_timeout = 0;

            let rtt_sample = time_lag(current_time, sent_time);
            peer.adjust_throttle(rtt_sample);

            peer.rtt_variance -= peer.rtt_variance / 4;
            if rtt_sample >= peer.rtt {
                peer.rtt += (rtt_sample - peer.rtt) / 8;
                peer.rtt_variance += (rtt_sample - peer.rtt) / 4;
            } else {
                peer.rtt -= (peer.rtt - rtt_sample) / 8;
                peer.rtt_variance += (peer.rtt - rtt_sample) / 4;
            }

            if peer.rtt < peer.lowest_rtt {
                peer.lowest_rtt = peer.rtt;
            }
            if peer.rtt_variance > peer.highest_rtt_variance {
                peer.highest_rtt_variance = peer.rtt_variance;
            }

            if peer.packet_throttle_epoch == 0
                || time_lag(current_time, peer.packet_throttle_epoch) >= peer.throttle.interval
            {
                peer.last_rtt = peer.lowest_rtt;
                peer.last_rtt_variance = peer.highest_rtt_variance;
                peer.lowest_rtt = peer.rtt;
                peer.highest_rtt_variance = peer.rtt_variance;
                peer.packet_throttle_epoch = current_time;
            }
        }

        let acked_kind =
            self.dispose_acknowledged(index, received_sequence_number, message.channel_id);

        match self.peers[index].state {
            PeerState::AcknowledgingConnect => {
                if acked_kind != Some(MessageKind::ValidateConnect) {
                    return Ok(Disposition::Discarded);
                }
                Ok(Disposition::Handled(self.notify_connect(index, allow_event)))
            }
            PeerState::Disconnecting => {
                if acked_kind != Some(MessageKind::Disconnect) {
                    return Ok(Disposition::Discarded);
                }
                Ok(Disposition::Handled(
                    self.notify_disconnect(index, allow_event),
                ))
            }
            PeerState::DelayingDisconnect => {
                let peer = &self.peers[index];
                if peer.outgoing_reliable.is_empty()
                    && peer.outgoing_unreliable.is_empty()
                    && peer.sent_reliable.is_empty()
                {
                    self.close_gracefully(index)?;
                }
                Ok(Disposition::Handled(None))
            }
            _ => Ok(Disposition::Handled(None)),
        }
    }

    /// Removes the acknowledged message from the pending set, returning its
    /// kind. Re-anchors the retransmission timer to the new head.
    fn dispose_acknowledged(
        &mut self,
        index: usize,
        sequence_number: u16,
        channel_id: u8,
    ) -> Option<MessageKind> {
        let peer = &mut self.peers[index];
        let position = peer.sent_reliable.iter().position(|message| {
            message.reliable_seq == sequence_number && message.message.channel_id == channel_id
        })?;
        let message = peer.sent_reliable.remove(position)?;

        if message.packet.is_some() {
            peer.reliable_data_in_transit -= u32::from(message.fragment_length);
        }
        let kind = message.message.kind();

        if let Some(head) = peer.sent_reliable.front() {
            peer.next_timeout = head.sent_time.wrapping_add(head.rto);
        }
        Some(kind)
    }

    fn on_connect(
        &mut self,
        peer_index: &mut Option<usize>,
        header: &PacketHeader,
        body: &ConnectBody,
        sender: SocketAddr,
        datagram: &[u8],
    ) -> Result<Disposition> {
        if self.checksums {
            // the connect is not bound to a peer yet, so the checksum is
            // verified against the session id the message itself declares
            let computed =
                PacketHeader::checksum_with_session_id(datagram, body.session_id);
            if computed != header.session_id {
                debug!("connect with corrupt checksum from {:?}", sender);
                return Ok(Disposition::Discarded);
            }
        }

        if body.channel_count == 0 {
            return Ok(Disposition::Discarded);
        }
        let Some(compression_level) = CompressionLevel::from_wire(body.compression_level)
        else {
            return Ok(Disposition::Discarded);
        };

        let duplicate = self.peers.iter().any(|peer| {
            peer.state != PeerState::Disconnected
                && peer.remote_endpoint == Some(sender)
                && peer.session_id == body.session_id
        });
        if duplicate {
            trace!("replayed connect from {:?}", sender);
            return Ok(Disposition::Discarded);
        }

        let Some(index) = self.free_slot() else {
            debug!("refusing connect from {:?}: peer table is full", sender);
            return Ok(Disposition::Discarded);
        };

        let incoming_bandwidth = self.incoming_bandwidth;
        let outgoing_bandwidth = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];

        peer.state = PeerState::AcknowledgingConnect;
        peer.session_id = body.session_id;
        peer.remote_client_id = body.client_id;
        peer.remote_endpoint = Some(sender);
        peer.is_multicast_member = false;
        peer.channels = (0..body.channel_count).map(|_| Channel::new()).collect();
        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;
        peer.throttle = ThrottleConfig {
            interval: body.throttle_interval,
            acceleration: body.throttle_acceleration,
            deceleration: body.throttle_deceleration,
        };
        peer.compression_level = Some(compression_level);
        peer.mtu = body.mtu.clamp(MIN_MTU, MAX_MTU);

        // window for our sends toward this peer: bounded by our upstream cap
        // and the peer's claimed downstream cap
        peer.window_size = if outgoing_bandwidth == 0 && body.incoming_bandwidth == 0 {
            MAX_WINDOW_SIZE
        } else {
            (outgoing_bandwidth.min(body.incoming_bandwidth) / WINDOW_SIZE_SCALE
                * MIN_WINDOW_SIZE)
                .clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
        };

        // window we grant the peer for its sends toward us
        let granted_window = if incoming_bandwidth == 0 {
            MAX_WINDOW_SIZE
        } else {
            (incoming_bandwidth / WINDOW_SIZE_SCALE * MIN_WINDOW_SIZE)
                .min(body.window_size)
                .clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
        };

        let reply = Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 0,
            body: MessageBody::ValidateConnect(ValidateConnectBody {
                client_id: peer.index,
                channel_count: body.channel_count,
                mtu: peer.mtu,
                window_size: granted_window,
                incoming_bandwidth,
                outgoing_bandwidth,
                throttle_interval: peer.throttle.interval,
                throttle_acceleration: peer.throttle.acceleration,
                throttle_deceleration: peer.throttle.deceleration,
                compression_level: body.compression_level,
            }),
        };
        peer.queue_outgoing(reply, None, 0, 0);

        debug!(
            "accepted connect from {:?} into {}",
            sender,
            PeerId(index as u16)
        );
        *peer_index = Some(index);
        Ok(Disposition::Handled(None))
    }

    fn on_validate_connect(
        &mut self,
        index: usize,
        body: &ValidateConnectBody,
        allow_event: bool,
    ) -> Result<Disposition> {
        {
            let peer = &mut self.peers[index];
            if peer.state != PeerState::Connecting {
                return Ok(Disposition::Discarded);
            }

            let mismatch = body.channel_count != peer.channel_count()
                || body.throttle_interval != peer.throttle.interval
                || body.throttle_acceleration != peer.throttle.acceleration
                || body.throttle_deceleration != peer.throttle.deceleration
                || CompressionLevel::from_wire(body.compression_level)
                    != peer.compression_level;
            if mismatch {
                // the other side negotiated parameters we never proposed;
                // incompatible implementation, not worth retrying
                warn!(
                    "handshake parameter mismatch from {:?}, killing connection",
                    peer.remote_endpoint
                );
                peer.state = PeerState::Zombie;
                return Ok(Disposition::Discarded);
            }
        }

        // the connect consumed sequence number 1 on the control channel
        self.dispose_acknowledged(index, 1, CONTROL_CHANNEL_ID);

        let peer = &mut self.peers[index];
        peer.remote_client_id = body.client_id;

        let mtu = body.mtu.clamp(MIN_MTU, MAX_MTU);
        if mtu < peer.mtu {
            peer.mtu = mtu;
        }
        let window = body.window_size.clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE);
        if window < peer.window_size {
            peer.window_size = window;
        }
        peer.incoming_bandwidth = body.incoming_bandwidth;
        peer.outgoing_bandwidth = body.outgoing_bandwidth;

        Ok(Disposition::Handled(self.notify_connect(index, allow_event)))
    }

    fn on_disconnect(&mut self, index: usize, message: &Message) -> Result<Disposition> {
        let state = self.peers[index].state;
        self.peers[index].clear_queues();

        match state {
            PeerState::ConnectionSucceeded => {
                // the application never saw this peer as connected
                self.peers[index].state = PeerState::Zombie;
                Ok(Disposition::Handled(None))
            }
            PeerState::Connected | PeerState::DelayingDisconnect => {
                self.peers[index].state =
                    if message.flags.contains(MessageFlags::ACKNOWLEDGE) {
                        PeerState::AcknowledgingDisconnect
                    } else {
                        PeerState::Zombie
                    };
                Ok(Disposition::Handled(None))
            }
            other => {
                if other == PeerState::ConnectionPending {
                    self.reconfigure_bandwidth = true;
                }
                self.reset_peer(index);
                Ok(Disposition::Discarded)
            }
        }
    }

    fn on_data(
        &mut self,
        index: usize,
        message: &Message,
        payload: &[u8],
        sender: SocketAddr,
    ) -> Result<Disposition> {
        let peer = &mut self.peers[index];
        if message.channel_id as usize >= peer.channels.len() || !peer.is_established() {
            return Ok(Disposition::Discarded);
        }

        if let MessageBody::UnsequencedData { group, .. } = message.body {
            if !peer.admit_unsequenced_group(group) {
                return Ok(Disposition::Handled(None));
            }
        }

        match peer.queue_incoming_data(message, payload, sender) {
            QueueIncoming::Queued => Ok(Disposition::Handled(None)),
            QueueIncoming::Duplicate => {
                if message.flags.contains(MessageFlags::ACKNOWLEDGE) {
                    // already delivered, but the previous acknowledgement may
                    // have been lost; answer again
                    Ok(Disposition::Handled(None))
                } else {
                    Ok(Disposition::Discarded)
                }
            }
            QueueIncoming::Refused => Ok(Disposition::Discarded),
        }
    }

    fn on_data_fragment(
        &mut self,
        index: usize,
        message: &Message,
        body: &DataFragmentBody,
        payload: &[u8],
        sender: SocketAddr,
    ) -> Result<Disposition> {
        let peer = &mut self.peers[index];
        if message.channel_id as usize >= peer.channels.len()
            || peer.state != PeerState::Connected
        {
            return Ok(Disposition::Discarded);
        }

        let channel_index = message.channel_id as usize;
        let watermark = peer.channels[channel_index].incoming_reliable_seq;
        let extended = extend(body.start_sequence_number, watermark);
        if is_stale(extended, watermark) {
            // belongs to an already delivered payload; re-acknowledge
            return Ok(Disposition::Handled(None));
        }

        let fragment_end = u64::from(body.fragment_offset) + payload.len() as u64;
        if body.fragment_offset >= body.total_length
            || fragment_end > u64::from(body.total_length)
            || body.fragment_number >= body.fragment_count
            || body.fragment_count == 0
            || body.total_length as usize > MAX_PACKET_SIZE
            || u64::from(body.fragment_count) > u64::from(body.total_length)
        {
            return Ok(Disposition::Discarded);
        }

        let start_seq = (extended & 0xFFFF) as u16;
        if peer.channels[channel_index].find_reassembly(start_seq).is_none() {
            let reassembly = IncomingMessage::reassembly(
                message.flags,
                start_seq,
                body.fragment_count,
                body.total_length,
                sender,
            );
            match peer.channels[channel_index].insert_reliable(reassembly, extended) {
                Insertion::Queued => {}
                Insertion::Duplicate => return Ok(Disposition::Discarded),
            }
        }

        let Some(reassembly) = peer.channels[channel_index].find_reassembly(start_seq)
        else {
            return Ok(Disposition::Discarded);
        };
        if reassembly.data.len() != body.total_length as usize
            || reassembly.fragment_count != body.fragment_count
        {
            // inconsistent with the reassembly already in flight
            return Ok(Disposition::Discarded);
        }

        reassembly.apply_fragment(body.fragment_number, body.fragment_offset, payload);
        Ok(Disposition::Handled(None))
    }

    fn on_configure_bandwidth(
        &mut self,
        index: usize,
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    ) -> Result<Disposition> {
        let host_outgoing = self.outgoing_bandwidth;
        let peer = &mut self.peers[index];
        peer.incoming_bandwidth = incoming_bandwidth;
        peer.outgoing_bandwidth = outgoing_bandwidth;

        peer.window_size = if peer.incoming_bandwidth == 0 && host_outgoing == 0 {
            MAX_WINDOW_SIZE
        } else {
            (peer.incoming_bandwidth.min(host_outgoing) / WINDOW_SIZE_SCALE * MIN_WINDOW_SIZE)
                .clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
        };
        Ok(Disposition::Handled(None))
    }

    /// Host-wide fair-share bandwidth distribution, run at most once per
    /// [`BANDWIDTH_THROTTLE_INTERVAL`].
    ///
    /// Outgoing pass: peers whose own downstream cap already admits their
    /// fair share are satisfied and leave the pool; the pass repeats until
    /// no peer can be satisfied, then the leftover pool shares the uniform
    /// throttle fraction. Both iterative passes are capped at the peer
    /// count; a pass that fails to converge falls back to the uniform split.
    fn throttle_bandwidth(&mut self) {
        let current_time = self.current_time;
        let elapsed = time_lag(current_time, self.bandwidth_throttle_epoch);
        if elapsed < BANDWIDTH_THROTTLE_INTERVAL {
            return;
        }

        let mut peers_total: u32 = 0;
        let mut data_total: u32 = 0;
        for peer in &self.peers {
            if peer.is_established() {
                peers_total += 1;
                data_total = data_total.wrapping_add(peer.outgoing_data_total);
            }
        }
        if peers_total == 0 {
            return;
        }

        let mut peers_remaining = peers_total;
        let mut needs_adjustment = true;
        let mut passes = 0;
        let mut throttle = 0;
        let mut bandwidth: u32 = if self.outgoing_bandwidth == 0 {
            u32::MAX
        } else {
            ((u64::from(self.outgoing_bandwidth) * u64::from(elapsed)) / 1000)
                .min(u64::from(u32::MAX)) as u32
        };

        while peers_remaining > 0 && needs_adjustment && passes < peers_total {
            needs_adjustment = false;
            passes += 1;

            throttle = if data_total < bandwidth {
                PACKET_THROTTLE_SCALE
            } else {
                ((u64::from(bandwidth) * u64::from(PACKET_THROTTLE_SCALE))
                    / u64::from(data_total)) as u32
            };

            for peer in &mut self.peers {
                if !peer.is_established()
                    || peer.incoming_bandwidth == 0
                    || peer.outgoing_bandwidth_epoch == current_time
                {
                    continue;
                }

                let peer_bandwidth = ((u64::from(peer.incoming_bandwidth)
                    * u64::from(elapsed))
                    / 1000)
                    .min(u64::from(u32::MAX)) as u32;
                if (u64::from(throttle) * u64::from(peer.outgoing_data_total))
                    / u64::from(PACKET_THROTTLE_SCALE)
                    <= u64::from(peer_bandwidth)
                {
                    continue;
                }

                // this peer's downstream cap is the binding constraint
                peer.packet_throttle_limit = (((u64::from(peer_bandwidth)
                    * u64::from(PACKET_THROTTLE_SCALE))
                    / u64::from(peer.outgoing_data_total))
                    as u32)
                    .max(1);
                if peer.packet_throttle > peer.packet_throttle_limit {
                    peer.packet_throttle = peer.packet_throttle_limit;
                }
                peer.outgoing_bandwidth_epoch = current_time;

                needs_adjustment = true;
                peers_remaining -= 1;
                bandwidth = bandwidth.saturating_sub(peer_bandwidth);
                data_total = data_total.saturating_sub(peer_bandwidth);
            }
        }

        if peers_remaining > 0 {
            for peer in &mut self.peers {
                if !peer.is_established() || peer.outgoing_bandwidth_epoch == current_time {
                    continue;
                }
                peer.packet_throttle_limit = throttle;
                if peer.packet_throttle > throttle {
                    peer.packet_throttle = throttle;
                }
            }
        }

        if self.reconfigure_bandwidth {
            self.reconfigure_bandwidth = false;

            let mut peers_remaining = peers_total;
            let mut bandwidth = self.incoming_bandwidth;
            let mut needs_adjustment = true;
            let mut passes = 0;
            let mut bandwidth_limit = 0;

            if bandwidth > 0 {
                while peers_remaining > 0 && needs_adjustment && passes < peers_total {
                    needs_adjustment = false;
                    passes += 1;
                    bandwidth_limit = bandwidth / peers_remaining;

                    for peer in &mut self.peers {
                        if !peer.is_established()
                            || peer.incoming_bandwidth_epoch == current_time
                        {
                            continue;
                        }
                        if peer.outgoing_bandwidth > 0
                            && peer.outgoing_bandwidth >= bandwidth_limit
                        {
                            continue;
                        }
                        // claims less than its fair share; grant the claim
                        peer.incoming_bandwidth_epoch = current_time;
                        needs_adjustment = true;
                        peers_remaining -= 1;
                        bandwidth = bandwidth.saturating_sub(peer.outgoing_bandwidth);
                    }
                }
            }

            let outgoing_bandwidth = self.outgoing_bandwidth;
            for peer in &mut self.peers {
                if !peer.is_established() {
                    continue;
                }
                let allotted = if peer.incoming_bandwidth_epoch == current_time {
                    peer.outgoing_bandwidth
                } else {
                    bandwidth_limit
                };
                let flags = if peer.is_multicast_member {
                    MessageFlags::UNSEQUENCED
                } else {
                    MessageFlags::ACKNOWLEDGE
                };
                let message = Message {
                    channel_id: CONTROL_CHANNEL_ID,
                    flags,
                    sequence_number: 0,
                    body: MessageBody::ConfigureBandwidth {
                        incoming_bandwidth: allotted,
                        outgoing_bandwidth,
                    },
                };
                peer.queue_outgoing(message, None, 0, 0);
            }
        }

        self.bandwidth_throttle_epoch = current_time;
        for peer in &mut self.peers {
            if peer.is_established() {
                trace!(
                    "peer slot {}: {}B in, {}B out this interval",
                    peer.index,
                    peer.incoming_data_total,
                    peer.outgoing_data_total
                );
            }
            peer.incoming_data_total = 0;
            peer.outgoing_data_total = 0;
        }
    }
}

/// Stages pending acknowledgements into the datagram. Acking a disconnect
/// is the peer's last act; the slot goes zombie as the ack is staged.
fn stage_acknowledgements(peer: &mut Peer, datagram: &mut OutboundDatagram) -> bool {
    loop {
        if peer.acknowledgements.is_empty() {
            return false;
        }
        if datagram.message_count >= MAX_MESSAGES_PER_DATAGRAM
            || datagram.budget(peer.mtu) < MessageKind::Acknowledge.wire_len()
        {
            return true;
        }
        let Some(acknowledgement) = peer.acknowledgements.pop_front() else {
            return false;
        };

        let message = Message {
            channel_id: acknowledgement.channel_id,
            flags: MessageFlags::empty(),
            sequence_number: 0,
            body: MessageBody::Acknowledge {
                received_sequence_number: acknowledgement.sequence_number,
                received_sent_time: acknowledgement.sent_time,
            },
        };
        message.ser(&mut datagram.body);
        datagram.message_count += 1;

        if acknowledgement.kind == MessageKind::Disconnect {
            peer.state = PeerState::Zombie;
        }
    }
}

/// Stages queued reliable messages, honoring the MTU and the in-transit
/// window, assigning send times and initial retransmission timeouts.
fn stage_reliable(peer: &mut Peer, datagram: &mut OutboundDatagram, current_time: u32) -> bool {
    loop {
        let Some(front) = peer.outgoing_reliable.front() else {
            return false;
        };
        let message_len = front.message.wire_len();

        if datagram.message_count >= MAX_MESSAGES_PER_DATAGRAM
            || datagram.budget(peer.mtu) < message_len
        {
            return true;
        }
        if front.packet.is_some() {
            if peer.reliable_data_in_transit + u32::from(front.fragment_length)
                > peer.window_size
            {
                // window full; wait for acknowledgements
                return false;
            }
            if datagram.budget(peer.mtu) < message_len + front.fragment_length as usize {
                return true;
            }
        }

        let Some(mut outgoing) = peer.outgoing_reliable.pop_front() else {
            return false;
        };

        if outgoing.rto == 0 {
            outgoing.rto = peer.rtt + 4 * peer.rtt_variance;
            outgoing.rto_limit = RTO_LIMIT_FACTOR * outgoing.rto;
        }
        if peer.sent_reliable.is_empty() {
            peer.next_timeout = current_time.wrapping_add(outgoing.rto);
        }
        outgoing.sent_time = current_time;

        outgoing.message.ser(&mut datagram.body);
        datagram.message_count += 1;
        datagram.header_flags |= HeaderFlags::SENT_TIME;

        if let Some(packet) = &outgoing.packet {
            let offset = outgoing.fragment_offset as usize;
            datagram
                .body
                .extend_from_slice(&packet.data()[offset..offset + outgoing.fragment_length as usize]);
            peer.reliable_data_in_transit += u32::from(outgoing.fragment_length);
        }

        peer.sent_reliable.push_back(outgoing);
    }
}

/// Stages queued unreliable messages. Messages carrying a payload pass
/// through the probabilistic throttle and may be shed instead of sent.
fn stage_unreliable(peer: &mut Peer, datagram: &mut OutboundDatagram) -> bool {
    loop {
        let Some(front) = peer.outgoing_unreliable.front() else {
            return false;
        };
        let message_len = front.message.wire_len();
        let payload_len = front.packet.as_ref().map(Packet::len).unwrap_or(0);

        if datagram.message_count >= MAX_MESSAGES_PER_DATAGRAM
            || datagram.budget(peer.mtu) < message_len + payload_len
        {
            return true;
        }

        let Some(outgoing) = peer.outgoing_unreliable.pop_front() else {
            return false;
        };

        if outgoing.packet.is_some() {
            peer.packet_throttle_counter = (peer.packet_throttle_counter
                + PACKET_THROTTLE_COUNTER_STEP)
                % PACKET_THROTTLE_SCALE;
            if peer.packet_throttle_counter >= peer.packet_throttle {
                // shed instead of sending into a degrading path; the counter
                // is uniform over the scale, so the send probability is
                // exactly throttle / scale
                continue;
            }
        }

        outgoing.message.ser(&mut datagram.body);
        datagram.message_count += 1;

        if let Some(packet) = &outgoing.packet {
            datagram.body.extend_from_slice(packet.data());
            peer.sent_unreliable.push_back(outgoing);
        }
    }
}

fn is_multicast_address(address: IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MTU;

    fn established_peer(index: u16) -> Peer {
        let mut peer = Peer::new(index, DEFAULT_MTU);
        peer.state = PeerState::Connected;
        peer.channels = vec![Channel::new()];
        peer.remote_endpoint = Some("127.0.0.1:4000".parse().unwrap());
        peer
    }

    #[tokio::test]
    async fn bind_assigns_a_local_port() {
        let host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        assert_ne!(host.local_addr().port(), 0);
        assert_eq!(host.max_peers(), crate::config::DEFAULT_PEER_COUNT);
    }

    #[tokio::test]
    async fn connect_rejects_when_the_table_is_full() {
        let config = HostConfig {
            max_peers: 1,
            ..HostConfig::default()
        };
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        let remote: SocketAddr = "127.0.0.1:5000".parse().unwrap();

        host.connect(remote, 1, CompressionLevel::Fast).unwrap();
        assert!(matches!(
            host.connect("127.0.0.1:5001".parse().unwrap(), 1, CompressionLevel::Fast),
            Err(XudpError::PeerLimitReached(1))
        ));
    }

    /// Multicast membership skips the handshake: the slot is connected at
    /// once, addressed by the group id, and rejects reliable traffic.
    #[tokio::test]
    async fn joining_a_multicast_group_skips_the_handshake() {
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        // a group port different from the local port keeps the socket's
        // OS-level membership out of the picture
        let group: SocketAddr = "239.1.2.3:9999".parse().unwrap();

        let peer = host.join_multicast_group(group, 0, 1, 2).unwrap();
        assert_eq!(host.peer_state(peer).unwrap(), PeerState::Connected);
        assert!(host.is_multicast_member(peer).unwrap());
        assert_eq!(host.channel_count(peer).unwrap(), 2);

        assert!(matches!(
            host.join_multicast_group(group, 0, 1, 2),
            Err(XudpError::MulticastGroupAlreadyJoined)
        ));
        assert!(matches!(
            host.send(peer, 0, Packet::reliable(vec![0u8; 4])),
            Err(XudpError::Unsupported(_))
        ));
        assert!(matches!(host.ping(peer), Err(XudpError::Unsupported(_))));
    }

    /// With the throttle at zero every unreliable payload is shed; at full
    /// scale none are.
    #[test]
    fn unreliable_shedding_follows_the_throttle() {
        for (throttle, expected_sent) in [(0, 0), (PACKET_THROTTLE_SCALE, 40)] {
            let mut peer = established_peer(0);
            peer.packet_throttle = throttle;
            for _ in 0..40 {
                peer.queue_packet(0, Packet::unreliable(vec![1u8; 8]), false);
            }

            let mut sent = 0;
            while !peer.outgoing_unreliable.is_empty() {
                let mut datagram = OutboundDatagram::new(false);
                stage_unreliable(&mut peer, &mut datagram);
                sent += datagram.message_count;
                peer.sent_unreliable.clear();
            }
            assert_eq!(sent, expected_sent);
        }
    }

    /// A 1000 B/s host with two peers each demanding
    /// 2000 B/s settles on an even split, i.e. a quarter of the throttle
    /// scale each.
    #[tokio::test]
    async fn bandwidth_allocation_splits_evenly_between_equal_peers() {
        let config = HostConfig {
            max_peers: 2,
            outgoing_bandwidth: 1000,
            ..HostConfig::default()
        };
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        for index in 0..2 {
            host.peers[index] = established_peer(index as u16);
            host.peers[index].outgoing_data_total = 2000;
        }

        host.current_time = BANDWIDTH_THROTTLE_INTERVAL;
        host.throttle_bandwidth();

        for index in 0..2 {
            assert_eq!(
                host.peers[index].packet_throttle_limit,
                PACKET_THROTTLE_SCALE * 1000 / 4000
            );
            assert_eq!(host.peers[index].outgoing_data_total, 0);
        }
    }

    /// A peer whose own downstream cap is the binding constraint is carved
    /// out first; the rest share what remains.
    #[tokio::test]
    async fn bandwidth_allocation_satisfies_capped_peers_first() {
        let config = HostConfig {
            max_peers: 2,
            outgoing_bandwidth: 1000,
            ..HostConfig::default()
        };
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), config).unwrap();
        for index in 0..2 {
            host.peers[index] = established_peer(index as u16);
            host.peers[index].outgoing_data_total = 2000;
        }
        host.peers[0].incoming_bandwidth = 100;

        host.current_time = BANDWIDTH_THROTTLE_INTERVAL;
        host.throttle_bandwidth();

        // peer 0 is limited by its own 100 B/s claim
        assert_eq!(
            host.peers[0].packet_throttle_limit,
            (100 * PACKET_THROTTLE_SCALE / 2000).max(1)
        );
        // peer 1 shares what remains: 900 B/s against the adjusted demand
        assert_eq!(
            host.peers[1].packet_throttle_limit,
            900 * PACKET_THROTTLE_SCALE / (4000 - 100)
        );
    }

    fn validate_body(channel_count: u8) -> ValidateConnectBody {
        ValidateConnectBody {
            client_id: 4,
            channel_count,
            mtu: DEFAULT_MTU,
            window_size: MAX_WINDOW_SIZE,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            throttle_interval: crate::config::DEFAULT_THROTTLE_INTERVAL,
            throttle_acceleration: crate::config::DEFAULT_THROTTLE_ACCELERATION,
            throttle_deceleration: crate::config::DEFAULT_THROTTLE_DECELERATION,
            compression_level: CompressionLevel::Fast.to_wire(),
        }
    }

    /// Echoed handshake parameters that differ from what was proposed mean
    /// an incompatible implementation: the peer dies without a Connect
    /// event.
    #[tokio::test]
    async fn mismatched_validate_connect_kills_the_connection() {
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        let peer = host
            .connect("127.0.0.1:6000".parse().unwrap(), 2, CompressionLevel::Fast)
            .unwrap();
        let index = peer.index() as usize;

        let disposition = host
            .on_validate_connect(index, &validate_body(3), true)
            .unwrap();
        assert!(matches!(disposition, Disposition::Discarded));
        assert_eq!(host.peers[index].state, PeerState::Zombie);
    }

    #[tokio::test]
    async fn matching_validate_connect_completes_the_handshake() {
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        let peer = host
            .connect("127.0.0.1:6000".parse().unwrap(), 2, CompressionLevel::Fast)
            .unwrap();
        let index = peer.index() as usize;

        let disposition = host
            .on_validate_connect(index, &validate_body(2), true)
            .unwrap();
        assert!(matches!(
            disposition,
            Disposition::Handled(Some(Event::Connect { .. }))
        ));
        assert_eq!(host.peers[index].state, PeerState::Connected);
        assert_eq!(host.peers[index].remote_client_id, 4);
    }

    #[tokio::test]
    async fn retransmission_backs_off_and_requeues() {
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        host.peers[0] = established_peer(0);
        host.peers[0].queue_packet(0, Packet::reliable(vec![0u8; 10]), false);

        // first send pass puts the message in flight
        host.current_time = 1;
        host.send_outgoing(false).unwrap();
        assert_eq!(host.peers[0].sent_reliable.len(), 1);
        let rto = host.peers[0].sent_reliable[0].rto;
        assert_eq!(rto, host.peers[0].rtt + 4 * host.peers[0].rtt_variance);

        // past the timeout: message moves back to the outgoing queue with a
        // doubled timeout
        host.current_time = 1 + rto;
        let event = host.check_for_timeouts(0).unwrap();
        assert!(event.is_none());
        assert!(host.peers[0].sent_reliable.is_empty());
        assert_eq!(host.peers[0].outgoing_reliable.len(), 1);
        assert_eq!(host.peers[0].outgoing_reliable[0].rto, rto * 2);
    }

    #[tokio::test]
    async fn a_peer_past_the_hard_ceiling_is_disconnected() {
        let mut host = Host::bind("127.0.0.1:0".parse().unwrap(), HostConfig::default()).unwrap();
        host.peers[0] = established_peer(0);
        host.peers[0].queue_packet(0, Packet::reliable(vec![0u8; 10]), false);

        host.current_time = 1;
        host.send_outgoing(false).unwrap();

        host.current_time = 1 + MAX_TIMEOUT;
        let event = host.check_for_timeouts(0).unwrap();
        assert!(matches!(event, Some(Event::Disconnect { .. })));
        assert_eq!(host.peers[0].state, PeerState::Disconnected);
    }
}
