use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::TryFromPrimitive;

use crate::error::DecodeError;

/// Channel id reserved for connection-control messages not tied to any
/// application channel.
pub const CONTROL_CHANNEL_ID: u8 = 0xFF;

/// Serialized length of the per-message header.
pub const MESSAGE_HEADER_LEN: usize = 5;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// The sender expects this message to be acknowledged.
        const ACKNOWLEDGE = 1 << 0;
        /// The message is outside all sequencing.
        const UNSEQUENCED = 1 << 1;
        /// The payload is deflated.
        const COMPRESSED  = 1 << 2;
        /// Reserved; encryption is not implemented.
        const ENCRYPTED   = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageKind {
    Acknowledge = 1,
    Connect = 2,
    ValidateConnect = 3,
    Disconnect = 4,
    JoinMulticastGroup = 5,
    LeaveMulticastGroup = 6,
    Ping = 7,
    ReliableData = 8,
    UnreliableData = 9,
    UnsequencedData = 10,
    DataFragment = 11,
    ConfigureBandwidth = 12,
    ConfigureThrottle = 13,
}

impl MessageKind {
    /// Fixed serialized body length beyond the message header. Data kinds
    /// declare their payload length inside the body; the payload bytes
    /// follow the body and are not counted here.
    pub fn body_len(self) -> usize {
        match self {
            MessageKind::Acknowledge => 4,
            MessageKind::Connect => 34,
            MessageKind::ValidateConnect => 30,
            MessageKind::Disconnect => 0,
            MessageKind::JoinMulticastGroup => 0,
            MessageKind::LeaveMulticastGroup => 0,
            MessageKind::Ping => 0,
            MessageKind::ReliableData => 2,
            MessageKind::UnreliableData => 4,
            MessageKind::UnsequencedData => 4,
            MessageKind::DataFragment => 20,
            MessageKind::ConfigureBandwidth => 8,
            MessageKind::ConfigureThrottle => 12,
        }
    }

    pub fn wire_len(self) -> usize {
        MESSAGE_HEADER_LEN + self.body_len()
    }
}

/// Parameters a connecting side proposes for the new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub client_id: u16,
    pub session_id: u32,
    pub channel_count: u8,
    pub mtu: u16,
    pub window_size: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub throttle_interval: u32,
    pub throttle_acceleration: u32,
    pub throttle_deceleration: u32,
    pub compression_level: u8,
}

/// The accepting side's answer, echoing the negotiable parameters it
/// settled on. Echoed parameters that were not negotiable must match the
/// connect exactly or the connecting side kills the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidateConnectBody {
    pub client_id: u16,
    pub channel_count: u8,
    pub mtu: u16,
    pub window_size: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub throttle_interval: u32,
    pub throttle_acceleration: u32,
    pub throttle_deceleration: u32,
    pub compression_level: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragmentBody {
    /// Reliable sequence number the first fragment consumes; all fragments
    /// of one payload share it.
    pub start_sequence_number: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub fragment_offset: u32,
    pub total_length: u32,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Acknowledge {
        received_sequence_number: u16,
        received_sent_time: u16,
    },
    Connect(ConnectBody),
    ValidateConnect(ValidateConnectBody),
    Disconnect,
    JoinMulticastGroup,
    LeaveMulticastGroup,
    Ping,
    ReliableData {
        length: u16,
    },
    UnreliableData {
        sequence_number: u16,
        length: u16,
    },
    UnsequencedData {
        group: u16,
        length: u16,
    },
    DataFragment(DataFragmentBody),
    ConfigureBandwidth {
        incoming_bandwidth: u32,
        outgoing_bandwidth: u32,
    },
    ConfigureThrottle {
        interval: u32,
        acceleration: u32,
        deceleration: u32,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Acknowledge { .. } => MessageKind::Acknowledge,
            MessageBody::Connect(_) => MessageKind::Connect,
            MessageBody::ValidateConnect(_) => MessageKind::ValidateConnect,
            MessageBody::Disconnect => MessageKind::Disconnect,
            MessageBody::JoinMulticastGroup => MessageKind::JoinMulticastGroup,
            MessageBody::LeaveMulticastGroup => MessageKind::LeaveMulticastGroup,
            MessageBody::Ping => MessageKind::Ping,
            MessageBody::ReliableData { .. } => MessageKind::ReliableData,
            MessageBody::UnreliableData { .. } => MessageKind::UnreliableData,
            MessageBody::UnsequencedData { .. } => MessageKind::UnsequencedData,
            MessageBody::DataFragment(_) => MessageKind::DataFragment,
            MessageBody::ConfigureBandwidth { .. } => MessageKind::ConfigureBandwidth,
            MessageBody::ConfigureThrottle { .. } => MessageKind::ConfigureThrottle,
        }
    }

    /// Declared payload length for the data-carrying kinds.
    pub fn payload_len(&self) -> Option<u16> {
        match self {
            MessageBody::ReliableData { length } => Some(*length),
            MessageBody::UnreliableData { length, .. } => Some(*length),
            MessageBody::UnsequencedData { length, .. } => Some(*length),
            MessageBody::DataFragment(body) => Some(body.length),
            _ => None,
        }
    }
}

/// One protocol message: header plus fixed-layout body. Several messages
/// are packed back to back into a datagram; payload bytes of data messages
/// directly follow their body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel_id: u8,
    pub flags: MessageFlags,
    pub sequence_number: u16,
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// Serialized length excluding any payload bytes.
    pub fn wire_len(&self) -> usize {
        self.kind().wire_len()
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind() as u8);
        buf.put_u8(self.channel_id);
        buf.put_u8(self.flags.bits());
        buf.put_u16(self.sequence_number);

        match &self.body {
            MessageBody::Acknowledge {
                received_sequence_number,
                received_sent_time,
            } => {
                buf.put_u16(*received_sequence_number);
                buf.put_u16(*received_sent_time);
            }
            MessageBody::Connect(body) => {
                buf.put_u16(body.client_id);
                buf.put_u32(body.session_id);
                buf.put_u8(body.channel_count);
                buf.put_u16(body.mtu);
                buf.put_u32(body.window_size);
                buf.put_u32(body.incoming_bandwidth);
                buf.put_u32(body.outgoing_bandwidth);
                buf.put_u32(body.throttle_interval);
                buf.put_u32(body.throttle_acceleration);
                buf.put_u32(body.throttle_deceleration);
                buf.put_u8(body.compression_level);
            }
            MessageBody::ValidateConnect(body) => {
                buf.put_u16(body.client_id);
                buf.put_u8(body.channel_count);
                buf.put_u16(body.mtu);
                buf.put_u32(body.window_size);
                buf.put_u32(body.incoming_bandwidth);
                buf.put_u32(body.outgoing_bandwidth);
                buf.put_u32(body.throttle_interval);
                buf.put_u32(body.throttle_acceleration);
                buf.put_u32(body.throttle_deceleration);
                buf.put_u8(body.compression_level);
            }
            MessageBody::Disconnect
            | MessageBody::JoinMulticastGroup
            | MessageBody::LeaveMulticastGroup
            | MessageBody::Ping => {}
            MessageBody::ReliableData { length } => {
                buf.put_u16(*length);
            }
            MessageBody::UnreliableData {
                sequence_number,
                length,
            } => {
                buf.put_u16(*sequence_number);
                buf.put_u16(*length);
            }
            MessageBody::UnsequencedData { group, length } => {
                buf.put_u16(*group);
                buf.put_u16(*length);
            }
            MessageBody::DataFragment(body) => {
                buf.put_u16(body.start_sequence_number);
                buf.put_u32(body.fragment_count);
                buf.put_u32(body.fragment_number);
                buf.put_u32(body.fragment_offset);
                buf.put_u32(body.total_length);
                buf.put_u16(body.length);
            }
            MessageBody::ConfigureBandwidth {
                incoming_bandwidth,
                outgoing_bandwidth,
            } => {
                buf.put_u32(*incoming_bandwidth);
                buf.put_u32(*outgoing_bandwidth);
            }
            MessageBody::ConfigureThrottle {
                interval,
                acceleration,
                deceleration,
            } => {
                buf.put_u32(*interval);
                buf.put_u32(*acceleration);
                buf.put_u32(*deceleration);
            }
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<Message, DecodeError> {
        if buf.remaining() < MESSAGE_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let kind_byte = buf.get_u8();
        let kind =
            MessageKind::try_from(kind_byte).map_err(|_| DecodeError::UnknownKind(kind_byte))?;
        let channel_id = buf.get_u8();
        let flags = MessageFlags::from_bits_truncate(buf.get_u8());
        let sequence_number = buf.get_u16();

        if buf.remaining() < kind.body_len() {
            return Err(DecodeError::Truncated);
        }

        let body = match kind {
            MessageKind::Acknowledge => MessageBody::Acknowledge {
                received_sequence_number: buf.get_u16(),
                received_sent_time: buf.get_u16(),
            },
            MessageKind::Connect => MessageBody::Connect(ConnectBody {
                client_id: buf.get_u16(),
                session_id: buf.get_u32(),
                channel_count: buf.get_u8(),
                mtu: buf.get_u16(),
                window_size: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                throttle_interval: buf.get_u32(),
                throttle_acceleration: buf.get_u32(),
                throttle_deceleration: buf.get_u32(),
                compression_level: buf.get_u8(),
            }),
            MessageKind::ValidateConnect => MessageBody::ValidateConnect(ValidateConnectBody {
                client_id: buf.get_u16(),
                channel_count: buf.get_u8(),
                mtu: buf.get_u16(),
                window_size: buf.get_u32(),
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
                throttle_interval: buf.get_u32(),
                throttle_acceleration: buf.get_u32(),
                throttle_deceleration: buf.get_u32(),
                compression_level: buf.get_u8(),
            }),
            MessageKind::Disconnect => MessageBody::Disconnect,
            MessageKind::JoinMulticastGroup => MessageBody::JoinMulticastGroup,
            MessageKind::LeaveMulticastGroup => MessageBody::LeaveMulticastGroup,
            MessageKind::Ping => MessageBody::Ping,
            MessageKind::ReliableData => MessageBody::ReliableData {
                length: buf.get_u16(),
            },
            MessageKind::UnreliableData => MessageBody::UnreliableData {
                sequence_number: buf.get_u16(),
                length: buf.get_u16(),
            },
            MessageKind::UnsequencedData => MessageBody::UnsequencedData {
                group: buf.get_u16(),
                length: buf.get_u16(),
            },
            MessageKind::DataFragment => MessageBody::DataFragment(DataFragmentBody {
                start_sequence_number: buf.get_u16(),
                fragment_count: buf.get_u32(),
                fragment_number: buf.get_u32(),
                fragment_offset: buf.get_u32(),
                total_length: buf.get_u32(),
                length: buf.get_u16(),
            }),
            MessageKind::ConfigureBandwidth => MessageBody::ConfigureBandwidth {
                incoming_bandwidth: buf.get_u32(),
                outgoing_bandwidth: buf.get_u32(),
            },
            MessageKind::ConfigureThrottle => MessageBody::ConfigureThrottle {
                interval: buf.get_u32(),
                acceleration: buf.get_u32(),
                deceleration: buf.get_u32(),
            },
        };

        Ok(Message {
            channel_id,
            flags,
            sequence_number,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn connect_message() -> Message {
        Message {
            channel_id: CONTROL_CHANNEL_ID,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 1,
            body: MessageBody::Connect(ConnectBody {
                client_id: 3,
                session_id: 0xA1B2_C3D4,
                channel_count: 2,
                mtu: 1400,
                window_size: 32768,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 56_000,
                throttle_interval: 5000,
                throttle_acceleration: 2,
                throttle_deceleration: 2,
                compression_level: 2,
            }),
        }
    }

    fn fragment_message() -> Message {
        Message {
            channel_id: 0,
            flags: MessageFlags::ACKNOWLEDGE,
            sequence_number: 9,
            body: MessageBody::DataFragment(DataFragmentBody {
                start_sequence_number: 9,
                fragment_count: 8,
                fragment_number: 2,
                fragment_offset: 2728,
                total_length: 10000,
                length: 1364,
            }),
        }
    }

    #[rstest]
    #[case(connect_message())]
    #[case(fragment_message())]
    #[case(Message {
        channel_id: CONTROL_CHANNEL_ID,
        flags: MessageFlags::empty(),
        sequence_number: 0,
        body: MessageBody::Acknowledge { received_sequence_number: 17, received_sent_time: 0x8001 },
    })]
    #[case(Message {
        channel_id: 1,
        flags: MessageFlags::UNSEQUENCED,
        sequence_number: 0,
        body: MessageBody::UnsequencedData { group: 5, length: 13 },
    })]
    fn test_ser_deser(#[case] original: Message) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), original.wire_len());

        let mut read: &[u8] = &buf;
        let deser = Message::deser(&mut read).unwrap();
        assert!(read.is_empty());
        assert_eq!(deser, original);
    }

    /// A truncated tail must stop decoding, not panic or misparse.
    #[test]
    fn truncated_body_is_rejected() {
        let mut buf = BytesMut::new();
        connect_message().ser(&mut buf);
        for cut in 1..buf.len() {
            let mut read: &[u8] = &buf[..cut];
            assert_eq!(Message::deser(&mut read), Err(DecodeError::Truncated));
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut read: &[u8] = &[0x2A, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(Message::deser(&mut read), Err(DecodeError::UnknownKind(0x2A)));

        let mut read: &[u8] = &[0x00, 0x00, 0x00, 0x00, 0x00];
        assert_eq!(Message::deser(&mut read), Err(DecodeError::UnknownKind(0)));
    }
}
