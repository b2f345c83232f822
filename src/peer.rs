use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::channel::{Channel, Insertion, IncomingMessage};
use crate::compress::{CompressionLevel, Compressor};
use crate::config::{
    DEFAULT_PACKET_THROTTLE, DEFAULT_ROUND_TRIP_TIME, DEFAULT_THROTTLE_ACCELERATION,
    DEFAULT_THROTTLE_DECELERATION, DEFAULT_THROTTLE_INTERVAL, MAX_WINDOW_SIZE,
    PACKET_THROTTLE_SCALE, UNSEQUENCED_WINDOW_SIZE, UNSEQUENCED_WINDOW_WORDS,
};
use crate::message::{
    DataFragmentBody, Message, MessageBody, MessageFlags, MessageKind, CONTROL_CHANNEL_ID,
};
use crate::packet::{Packet, PacketFlags};
use crate::packet_header::PacketHeader;
use crate::sequence::{extend, is_stale, SEQ_HIGH_BAND, SEQ_LOW_BAND};

/// Connection lifecycle of one peer slot.
///
/// Variant order is meaningful: the handshake progresses monotonically up to
/// `Connected`, and several teardown decisions compare states by how far the
/// handshake got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Slot is free.
    Disconnected,
    /// Outbound connect queued, awaiting the validate-connect answer.
    Connecting,
    /// Server side: validate-connect sent, awaiting its acknowledgement.
    AcknowledgingConnect,
    /// Handshake finished before the application asked for events; the
    /// Connect event is still pending dispatch.
    ConnectionPending,
    /// Like `ConnectionPending`, for the side that initiated the connect.
    ConnectionSucceeded,
    Connected,
    /// Graceful close requested while queues were non-empty; draining.
    DelayingDisconnect,
    /// Disconnect sent, awaiting its acknowledgement.
    Disconnecting,
    /// Remote asked to disconnect; the final acknowledgement still has to go
    /// out.
    AcknowledgingDisconnect,
    /// Torn down on the next dispatch pass.
    Zombie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush queues, request a disconnect acknowledgement, tear down once it
    /// arrives or the peer times out.
    Graceful,
    /// Let queued traffic drain first, then close gracefully.
    Delayed,
    /// Best-effort disconnect notification, then tear down unconditionally.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Epoch length over which RTT extremes are tracked, in milliseconds.
    pub interval: u32,
    /// Throttle increase per improving acknowledgement.
    pub acceleration: u32,
    /// Throttle decrease per worsening acknowledgement.
    pub deceleration: u32,
}

impl Default for ThrottleConfig {
    fn default() -> ThrottleConfig {
        ThrottleConfig {
            interval: DEFAULT_THROTTLE_INTERVAL,
            acceleration: DEFAULT_THROTTLE_ACCELERATION,
            deceleration: DEFAULT_THROTTLE_DECELERATION,
        }
    }
}

/// Outcome of filing a received data message into a channel.
pub(crate) enum QueueIncoming {
    Queued,
    /// Already delivered or already queued. For reliable kinds the sender is
    /// still owed an acknowledgement - its previous one may have been lost.
    Duplicate,
    /// The peer is not accepting data (draining toward disconnect).
    Refused,
}

/// A queued unit of outbound work: one protocol message, optionally backed
/// by (a slice of) an application packet.
pub(crate) struct OutgoingMessage {
    pub message: Message,
    pub reliable_seq: u16,
    pub unreliable_seq: u16,
    pub sent_time: u32,
    /// Retransmission timeout; 0 until first sent, then doubled per resend.
    pub rto: u32,
    pub rto_limit: u32,
    pub fragment_offset: u32,
    pub fragment_length: u16,
    pub packet: Option<Packet>,
}

/// Pending outbound acknowledgement for a received message.
pub(crate) struct Acknowledgement {
    /// Low 16 bits of the sender's clock, echoed back for RTT measurement.
    pub sent_time: u16,
    pub channel_id: u8,
    pub sequence_number: u16,
    /// Kind of the message being acknowledged; acking a disconnect is the
    /// local side's last act before the slot turns zombie.
    pub kind: MessageKind,
}

/// One remote endpoint: a unicast connection or a multicast-group
/// membership. Slots are owned by the host and recycled, never freed.
pub(crate) struct Peer {
    /// This side's slot index; remote peers address us by it.
    pub index: u16,
    pub state: PeerState,
    pub session_id: u32,
    pub remote_client_id: u16,
    pub remote_endpoint: Option<SocketAddr>,
    pub is_multicast_member: bool,
    pub multicast_interface: u32,
    pub channels: Vec<Channel>,
    pub compression_level: Option<CompressionLevel>,
    pub compressor: Option<Arc<dyn Compressor>>,

    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub incoming_bandwidth_epoch: u32,
    pub outgoing_bandwidth_epoch: u32,
    pub incoming_data_total: u32,
    pub outgoing_data_total: u32,

    pub last_receive_time: u32,
    /// When the earliest pending-ack message becomes overdue.
    pub next_timeout: u32,
    pub earliest_timeout: u32,

    pub packet_throttle: u32,
    pub packet_throttle_limit: u32,
    pub packet_throttle_counter: u32,
    pub packet_throttle_epoch: u32,
    pub throttle: ThrottleConfig,

    pub rtt: u32,
    pub rtt_variance: u32,
    pub last_rtt: u32,
    pub last_rtt_variance: u32,
    pub lowest_rtt: u32,
    pub highest_rtt_variance: u32,

    pub mtu: u16,
    pub window_size: u32,
    pub reliable_data_in_transit: u32,

    /// Sequence counter for control messages on the 0xFF channel.
    pub outgoing_reliable_seq: u16,
    pub incoming_unsequenced_group: u16,
    pub outgoing_unsequenced_group: u16,
    pub unsequenced_window: [u32; UNSEQUENCED_WINDOW_WORDS],

    pub acknowledgements: VecDeque<Acknowledgement>,
    /// Reliable messages awaiting acknowledgement, ordered by send time.
    pub sent_reliable: VecDeque<OutgoingMessage>,
    /// Unreliable messages staged into the datagram currently going out;
    /// cleared right after the socket write.
    pub sent_unreliable: VecDeque<OutgoingMessage>,
    pub outgoing_reliable: VecDeque<OutgoingMessage>,
    pub outgoing_unreliable: VecDeque<OutgoingMessage>,
}

impl Peer {
    pub fn new(index: u16, mtu: u16) -> Peer {
        let mut peer = Peer {
            index,
            state: PeerState::Disconnected,
            session_id: 0,
            remote_client_id: PacketHeader::UNASSIGNED_CLIENT_ID,
            remote_endpoint: None,
            is_multicast_member: false,
            multicast_interface: 0,
            channels: Vec::new(),
            compression_level: None,
            compressor: None,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            incoming_bandwidth_epoch: 0,
            outgoing_bandwidth_epoch: 0,
            incoming_data_total: 0,
            outgoing_data_total: 0,
            last_receive_time: 0,
            next_timeout: 0,
            earliest_timeout: 0,
            packet_throttle: 0,
            packet_throttle_limit: 0,
            packet_throttle_counter: 0,
            packet_throttle_epoch: 0,
            throttle: ThrottleConfig::default(),
            rtt: 0,
            rtt_variance: 0,
            last_rtt: 0,
            last_rtt_variance: 0,
            lowest_rtt: 0,
            highest_rtt_variance: 0,
            mtu,
            window_size: 0,
            reliable_data_in_transit: 0,
            outgoing_reliable_seq: 0,
            incoming_unsequenced_group: 0,
            outgoing_unsequenced_group: 0,
            unsequenced_window: [0; UNSEQUENCED_WINDOW_WORDS],
            acknowledgements: VecDeque::new(),
            sent_reliable: VecDeque::new(),
            sent_unreliable: VecDeque::new(),
            outgoing_reliable: VecDeque::new(),
            outgoing_unreliable: VecDeque::new(),
        };
        peer.reset(mtu);
        peer
    }

    /// Returns the slot to its pristine, reusable state.
    pub fn reset(&mut self, default_mtu: u16) {
        self.clear_queues();
        self.state = PeerState::Disconnected;
        self.session_id = 0;
        self.remote_client_id = PacketHeader::UNASSIGNED_CLIENT_ID;
        self.remote_endpoint = None;
        self.is_multicast_member = false;
        self.multicast_interface = 0;
        self.compression_level = None;
        self.compressor = None;
        self.incoming_bandwidth = 0;
        self.outgoing_bandwidth = 0;
        self.incoming_bandwidth_epoch = 0;
        self.outgoing_bandwidth_epoch = 0;
        self.incoming_data_total = 0;
        self.outgoing_data_total = 0;
        self.last_receive_time = 0;
        self.next_timeout = 0;
        self.earliest_timeout = 0;
        self.packet_throttle = DEFAULT_PACKET_THROTTLE;
        self.packet_throttle_limit = PACKET_THROTTLE_SCALE;
        self.packet_throttle_counter = 0;
        self.packet_throttle_epoch = 0;
        self.throttle = ThrottleConfig::default();
        self.rtt = DEFAULT_ROUND_TRIP_TIME;
        self.rtt_variance = 0;
        self.last_rtt = DEFAULT_ROUND_TRIP_TIME;
        self.last_rtt_variance = 0;
        self.lowest_rtt = DEFAULT_ROUND_TRIP_TIME;
        self.highest_rtt_variance = 0;
        self.mtu = default_mtu;
        self.window_size = MAX_WINDOW_SIZE;
        self.reliable_data_in_transit = 0;
        self.outgoing_reliable_seq = 0;
        self.incoming_unsequenced_group = 0;
        self.outgoing_unsequenced_group = 0;
        self.unsequenced_window = [0; UNSEQUENCED_WINDOW_WORDS];
    }

    /// Connected for all traffic purposes, including a peer draining toward
    /// a delayed disconnect.
    pub fn is_established(&self) -> bool {
        matches!(
            self.state,
            PeerState::Connected | PeerState::DelayingDisconnect
        )
    }

    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    pub fn clear_queues(&mut self) {
        self.acknowledgements.clear();
        self.sent_reliable.clear();
        self.sent_unreliable.clear();
        self.outgoing_reliable.clear();
        self.outgoing_unreliable.clear();
        self.channels.clear();
    }

    /// Assigns a sequence number and files the message into the matching
    /// outbound queue. Control messages (channel 0xFF) draw from the peer's
    /// own reliable counter, everything else from its channel's counters.
    pub fn queue_outgoing(
        &mut self,
        mut message: Message,
        packet: Option<Packet>,
        fragment_offset: u32,
        fragment_length: u16,
    ) {
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add((message.wire_len() + fragment_length as usize) as u32);

        let mut reliable_seq = 0;
        let mut unreliable_seq = 0;

        if message.channel_id == CONTROL_CHANNEL_ID {
            self.outgoing_reliable_seq = self.outgoing_reliable_seq.wrapping_add(1);
            reliable_seq = self.outgoing_reliable_seq;
        } else if message.flags.contains(MessageFlags::ACKNOWLEDGE) {
            let channel = &mut self.channels[message.channel_id as usize];
            channel.outgoing_reliable_seq = channel.outgoing_reliable_seq.wrapping_add(1);
            reliable_seq = channel.outgoing_reliable_seq;
        } else if message.flags.contains(MessageFlags::UNSEQUENCED) {
            self.outgoing_unsequenced_group = self.outgoing_unsequenced_group.wrapping_add(1);
        } else {
            let channel = &mut self.channels[message.channel_id as usize];
            channel.outgoing_unreliable_seq = channel.outgoing_unreliable_seq.wrapping_add(1);
            reliable_seq = channel.outgoing_reliable_seq;
            unreliable_seq = channel.outgoing_unreliable_seq;
        }

        message.sequence_number = reliable_seq;

        let reliable = message.flags.contains(MessageFlags::ACKNOWLEDGE);
        let outgoing = OutgoingMessage {
            message,
            reliable_seq,
            unreliable_seq,
            sent_time: 0,
            rto: 0,
            rto_limit: 0,
            fragment_offset,
            fragment_length,
            packet,
        };

        if reliable {
            self.outgoing_reliable.push_back(outgoing);
        } else {
            self.outgoing_unreliable.push_back(outgoing);
        }
    }

    /// Queues an application packet, splitting payloads that exceed what one
    /// datagram can carry into reliable fragments. All fragments of one
    /// packet share the reliable sequence number the first one will consume.
    pub fn queue_packet(&mut self, channel_id: u8, packet: Packet, compressed: bool) {
        let channel_index = channel_id as usize;
        let base_flags = if compressed {
            MessageFlags::COMPRESSED
        } else {
            MessageFlags::empty()
        };

        let fragment_capacity =
            self.mtu as usize - PacketHeader::FULL_LEN - MessageKind::DataFragment.wire_len();

        if packet.len() > fragment_capacity {
            let start_sequence_number =
                self.channels[channel_index].outgoing_reliable_seq.wrapping_add(1);
            let total_length = packet.len() as u32;
            let fragment_count =
                ((packet.len() + fragment_capacity - 1) / fragment_capacity) as u32;

            let mut fragment_number = 0;
            let mut offset = 0;
            while offset < packet.len() {
                let length = fragment_capacity.min(packet.len() - offset) as u16;
                let message = Message {
                    channel_id,
                    flags: base_flags | MessageFlags::ACKNOWLEDGE,
                    sequence_number: 0,
                    body: MessageBody::DataFragment(DataFragmentBody {
                        start_sequence_number,
                        fragment_count,
                        fragment_number,
                        fragment_offset: offset as u32,
                        total_length,
                        length,
                    }),
                };
                self.queue_outgoing(message, Some(packet.clone()), offset as u32, length);

                fragment_number += 1;
                offset += length as usize;
            }
        } else {
            let length = packet.len() as u16;
            let (flags, body) = if packet.flags().contains(PacketFlags::RELIABLE) {
                (
                    base_flags | MessageFlags::ACKNOWLEDGE,
                    MessageBody::ReliableData { length },
                )
            } else if packet.flags().contains(PacketFlags::UNSEQUENCED) {
                (
                    base_flags | MessageFlags::UNSEQUENCED,
                    MessageBody::UnsequencedData {
                        group: self.outgoing_unsequenced_group.wrapping_add(1),
                        length,
                    },
                )
            } else {
                (
                    base_flags,
                    MessageBody::UnreliableData {
                        sequence_number: self.channels[channel_index]
                            .outgoing_unreliable_seq
                            .wrapping_add(1),
                        length,
                    },
                )
            };
            let message = Message {
                channel_id,
                flags,
                sequence_number: 0,
                body,
            };
            self.queue_outgoing(message, Some(packet), 0, length);
        }
    }

    pub fn queue_ping(&mut self) {
        let message = Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 0,
            body: MessageBody::Ping,
        };
        self.queue_outgoing(message, None, 0, 0);
    }

    pub fn queue_acknowledgement(&mut self, message: &Message, sent_time: u16) {
        self.outgoing_data_total = self
            .outgoing_data_total
            .wrapping_add(MessageKind::Acknowledge.wire_len() as u32);

        self.acknowledgements.push_back(Acknowledgement {
            sent_time,
            channel_id: message.channel_id,
            sequence_number: message.sequence_number,
            kind: message.kind(),
        });
    }

    /// Files a received data message into its channel, enforcing the
    /// wrap-aware duplicate and ordering rules. The caller has validated the
    /// channel id.
    pub fn queue_incoming_data(
        &mut self,
        message: &Message,
        payload: &[u8],
        sender: SocketAddr,
    ) -> QueueIncoming {
        if self.state == PeerState::DelayingDisconnect {
            return QueueIncoming::Refused;
        }

        let kind = message.kind();
        let channel = &mut self.channels[message.channel_id as usize];

        match &message.body {
            MessageBody::ReliableData { .. } => {
                let extended =
                    extend(message.sequence_number, channel.incoming_reliable_seq);
                if extended == u32::from(channel.incoming_reliable_seq)
                    || is_stale(extended, channel.incoming_reliable_seq)
                {
                    return QueueIncoming::Duplicate;
                }
                let incoming = IncomingMessage::unfragmented(
                    kind,
                    message.flags,
                    message.sequence_number,
                    0,
                    payload,
                    sender,
                );
                match channel.insert_reliable(incoming, extended) {
                    Insertion::Queued => QueueIncoming::Queued,
                    Insertion::Duplicate => QueueIncoming::Duplicate,
                }
            }
            MessageBody::UnreliableData {
                sequence_number, ..
            } => {
                // the header sequence number pins this message behind the
                // reliable traffic it was sent after
                let reliable_extended =
                    extend(message.sequence_number, channel.incoming_reliable_seq);
                if is_stale(reliable_extended, channel.incoming_reliable_seq) {
                    return QueueIncoming::Duplicate;
                }

                let extended = extend(*sequence_number, channel.incoming_unreliable_seq);
                if extended <= u32::from(channel.incoming_unreliable_seq)
                    || (channel.incoming_unreliable_seq < SEQ_LOW_BAND
                        && (extended & 0xFFFF) as u16 >= SEQ_HIGH_BAND)
                {
                    return QueueIncoming::Duplicate;
                }
                let incoming = IncomingMessage::unfragmented(
                    kind,
                    message.flags,
                    message.sequence_number,
                    *sequence_number,
                    payload,
                    sender,
                );
                match channel.insert_unreliable(incoming, extended) {
                    Insertion::Queued => QueueIncoming::Queued,
                    Insertion::Duplicate => QueueIncoming::Duplicate,
                }
            }
            MessageBody::UnsequencedData { .. } => {
                let incoming = IncomingMessage::unfragmented(
                    kind,
                    message.flags,
                    message.sequence_number,
                    0,
                    payload,
                    sender,
                );
                channel.push_unsequenced(incoming);
                QueueIncoming::Queued
            }
            _ => QueueIncoming::Refused,
        }
    }

    /// Sliding-bitmap dedup for unsequenced groups. Returns false when the
    /// group was already seen; a group far outside the window resets it.
    pub fn admit_unsequenced_group(&mut self, group: u16) -> bool {
        let index = group % UNSEQUENCED_WINDOW_SIZE as u16;

        let beyond_window = u32::from(group)
            >= u32::from(self.incoming_unsequenced_group) + UNSEQUENCED_WINDOW_SIZE;
        let wrapped =
            self.incoming_unsequenced_group >= SEQ_HIGH_BAND && group < SEQ_LOW_BAND;

        if beyond_window || wrapped {
            self.incoming_unsequenced_group = group.wrapping_sub(index);
            self.unsequenced_window = [0; UNSEQUENCED_WINDOW_WORDS];
        } else if group < self.incoming_unsequenced_group
            || self.unsequenced_window[(index / 32) as usize] & (1 << (index % 32)) != 0
        {
            return false;
        }

        self.unsequenced_window[(index / 32) as usize] |= 1 << (index % 32);
        true
    }

    /// Packet-throttle adjustment driven by a fresh RTT sample. Returns the
    /// signal: +1 accelerated, -1 decelerated, 0 unchanged.
    pub fn adjust_throttle(&mut self, rtt_sample: u32) -> i32 {
        if self.last_rtt <= self.last_rtt_variance {
            // the previous epoch was noise-dominated; trust the limit
            self.packet_throttle = self.packet_throttle_limit;
        } else if rtt_sample < self.last_rtt {
            self.packet_throttle = (self.packet_throttle + self.throttle.acceleration)
                .min(self.packet_throttle_limit);
            return 1;
        } else if rtt_sample > self.last_rtt + 2 * self.last_rtt_variance {
            self.packet_throttle = self
                .packet_throttle
                .saturating_sub(self.throttle.deceleration);
            return -1;
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MTU;

    fn connected_peer(channel_count: usize) -> Peer {
        let mut peer = Peer::new(0, DEFAULT_MTU);
        peer.state = PeerState::Connected;
        peer.channels = (0..channel_count).map(|_| Channel::new()).collect();
        peer
    }

    #[test]
    fn control_messages_use_the_peer_counter() {
        let mut peer = connected_peer(1);
        peer.queue_ping();
        peer.queue_ping();

        assert_eq!(peer.outgoing_reliable_seq, 2);
        assert_eq!(peer.channels[0].outgoing_reliable_seq, 0);
        assert_eq!(peer.outgoing_reliable.len(), 2);
        assert_eq!(peer.outgoing_reliable[1].reliable_seq, 2);
    }

    #[test]
    fn small_packets_stay_whole() {
        let mut peer = connected_peer(1);
        peer.queue_packet(0, Packet::reliable(vec![0u8; 100]), false);

        assert_eq!(peer.outgoing_reliable.len(), 1);
        let queued = &peer.outgoing_reliable[0];
        assert_eq!(queued.message.kind(), MessageKind::ReliableData);
        assert_eq!(queued.fragment_length, 100);
    }

    #[test]
    fn oversized_packets_fragment_and_share_the_start_sequence() {
        let mut peer = connected_peer(1);
        let capacity =
            peer.mtu as usize - PacketHeader::FULL_LEN - MessageKind::DataFragment.wire_len();
        let total = capacity * 2 + 17;
        peer.queue_packet(0, Packet::reliable(vec![0u8; total]), false);

        assert_eq!(peer.outgoing_reliable.len(), 3);
        let mut covered = 0;
        for (number, queued) in peer.outgoing_reliable.iter().enumerate() {
            match &queued.message.body {
                MessageBody::DataFragment(body) => {
                    assert_eq!(body.start_sequence_number, 1);
                    assert_eq!(body.fragment_count, 3);
                    assert_eq!(body.fragment_number, number as u32);
                    assert_eq!(body.total_length, total as u32);
                    assert_eq!(body.fragment_offset, covered as u32);
                    covered += body.length as usize;
                }
                body => panic!("expected a fragment, got {body:?}"),
            }
        }
        assert_eq!(covered, total);
        // fragments consumed one channel sequence number each
        assert_eq!(peer.channels[0].outgoing_reliable_seq, 3);
    }

    #[test]
    fn unsequenced_window_rejects_repeats_and_slides() {
        let mut peer = connected_peer(1);

        assert!(peer.admit_unsequenced_group(1));
        assert!(!peer.admit_unsequenced_group(1));
        assert!(peer.admit_unsequenced_group(2));

        // far outside the window: reset and accept
        assert!(peer.admit_unsequenced_group(1000));
        assert!(!peer.admit_unsequenced_group(1000));
        // groups from before the slide are now stale
        assert!(!peer.admit_unsequenced_group(2));
    }

    #[test]
    fn throttle_signals_follow_rtt_movement() {
        let mut peer = connected_peer(1);
        peer.last_rtt = 100;
        peer.last_rtt_variance = 10;
        peer.packet_throttle = 16;

        assert_eq!(peer.adjust_throttle(50), 1);
        assert_eq!(peer.packet_throttle, 16 + DEFAULT_THROTTLE_ACCELERATION);

        // worse than last_rtt + 2 * variance
        assert_eq!(peer.adjust_throttle(200), -1);
        assert_eq!(peer.adjust_throttle(110), 0);
    }

    #[test]
    fn throttle_jumps_to_limit_when_noise_dominated() {
        let mut peer = connected_peer(1);
        peer.last_rtt = 5;
        peer.last_rtt_variance = 20;
        peer.packet_throttle = 1;
        peer.packet_throttle_limit = 24;

        assert_eq!(peer.adjust_throttle(400), 0);
        assert_eq!(peer.packet_throttle, 24);
    }

    #[test]
    fn throttle_never_underflows() {
        let mut peer = connected_peer(1);
        peer.last_rtt = 100;
        peer.last_rtt_variance = 0;
        peer.packet_throttle = 1;
        peer.throttle.deceleration = 5;

        assert_eq!(peer.adjust_throttle(500), -1);
        assert_eq!(peer.packet_throttle, 0);
    }

    #[test]
    fn duplicate_reliable_data_is_flagged() {
        let mut peer = connected_peer(1);
        let message = Message {
            channel_id: 0,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 1,
            body: MessageBody::ReliableData { length: 3 },
        };

        assert!(matches!(
            peer.queue_incoming_data(&message, b"abc", "127.0.0.1:9".parse().unwrap()),
            QueueIncoming::Queued
        ));
        assert!(matches!(
            peer.queue_incoming_data(&message, b"abc", "127.0.0.1:9".parse().unwrap()),
            QueueIncoming::Duplicate
        ));
    }
}
