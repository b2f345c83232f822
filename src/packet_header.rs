use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::config::PROTOCOL_VERSION;
use crate::error::DecodeError;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

bitflags! {
    /// Flags packed into the two low bits of the header's version byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// The optional 16-bit sent-time field is present.
        const SENT_TIME = 1 << 0;
        /// The datagram targets a multicast group; the client id field holds
        /// the group id rather than a peer slot.
        const MULTICAST = 1 << 1;
    }
}

/// Fixed datagram header, preceding all messages.
///
/// ```ascii
/// 0:  protocol id: u16 (16-bit hash of the protocol tag)
/// 2:  6-bit protocol version | 2-bit header flags: u8
/// 3:  session id: u32 - or a CRC32 of the whole datagram when checksums
///     are enabled, computed with the true session id in this field
/// 7:  client id: u16 (recipient's peer slot, or the multicast group id,
///     or 0xFFFF for a connect not yet assigned a slot)
/// 9:  sent time: u16 (low half of the sender's clock; only if SENT_TIME)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: HeaderFlags,
    pub session_id: u32,
    pub client_id: u16,
    pub sent_time: Option<u16>,
}

impl PacketHeader {
    /// Serialized length without the sent-time field.
    pub const BASE_LEN: usize = 9;
    /// Serialized length with the sent-time field.
    pub const FULL_LEN: usize = 11;
    /// Byte offset of the session id / checksum field.
    const SESSION_ID_OFFSET: usize = 3;

    /// Client id of a connect message not yet bound to a peer slot.
    pub const UNASSIGNED_CLIENT_ID: u16 = 0xFFFF;

    pub fn serialized_len(&self) -> usize {
        if self.sent_time.is_some() {
            Self::FULL_LEN
        } else {
            Self::BASE_LEN
        }
    }

    pub fn ser(&self, protocol_id: u16, buf: &mut BytesMut) {
        buf.put_u16(protocol_id);
        buf.put_u8((PROTOCOL_VERSION << 2) | self.flags.bits());
        buf.put_u32(self.session_id);
        buf.put_u16(self.client_id);
        if let Some(sent_time) = self.sent_time {
            buf.put_u16(sent_time);
        }
    }

    pub fn deser(buf: &mut impl Buf, protocol_id: u16) -> Result<PacketHeader, DecodeError> {
        if buf.remaining() < Self::BASE_LEN {
            return Err(DecodeError::Truncated);
        }
        if buf.get_u16() != protocol_id {
            return Err(DecodeError::ForeignProtocol);
        }
        let version_and_flags = buf.get_u8();
        let version = version_and_flags >> 2;
        if version > PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let flags = HeaderFlags::from_bits_truncate(version_and_flags & 0x03);
        let session_id = buf.get_u32();
        let client_id = buf.get_u16();
        let sent_time = if flags.contains(HeaderFlags::SENT_TIME) {
            if buf.remaining() < 2 {
                return Err(DecodeError::Truncated);
            }
            Some(buf.get_u16())
        } else {
            None
        };

        Ok(PacketHeader {
            flags,
            session_id,
            client_id,
            sent_time,
        })
    }

    /// Overwrites the session-id field of an already serialized datagram,
    /// used to drop the checksum into place after the CRC is known.
    pub fn patch_session_id(datagram: &mut [u8], value: u32) {
        datagram[Self::SESSION_ID_OFFSET..Self::SESSION_ID_OFFSET + 4]
            .copy_from_slice(&value.to_be_bytes());
    }

    /// CRC32 of a datagram as it would read with `session_id` in the
    /// session field, without touching the buffer.
    pub fn checksum_with_session_id(datagram: &[u8], session_id: u32) -> u32 {
        let mut digest = CRC32.digest();
        digest.update(&datagram[..Self::SESSION_ID_OFFSET]);
        digest.update(&session_id.to_be_bytes());
        digest.update(&datagram[Self::SESSION_ID_OFFSET + 4..]);
        digest.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TEST_PROTOCOL_ID: u16 = 0x1234;

    #[rstest]
    #[case(None)]
    #[case(Some(0xBEEF))]
    fn test_ser_deser(#[case] sent_time: Option<u16>) {
        let mut flags = HeaderFlags::MULTICAST;
        if sent_time.is_some() {
            flags |= HeaderFlags::SENT_TIME;
        }
        let original = PacketHeader {
            flags,
            session_id: 0xDEAD_BEEF,
            client_id: 7,
            sent_time,
        };

        let mut buf = BytesMut::new();
        original.ser(TEST_PROTOCOL_ID, &mut buf);
        assert_eq!(buf.len(), original.serialized_len());

        let mut read: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut read, TEST_PROTOCOL_ID).unwrap();
        assert!(read.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn foreign_protocol_id_is_rejected() {
        let header = PacketHeader {
            flags: HeaderFlags::empty(),
            session_id: 1,
            client_id: 0,
            sent_time: None,
        };
        let mut buf = BytesMut::new();
        header.ser(TEST_PROTOCOL_ID, &mut buf);

        let mut read: &[u8] = &buf;
        assert_eq!(
            PacketHeader::deser(&mut read, TEST_PROTOCOL_ID + 1),
            Err(DecodeError::ForeignProtocol)
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut read: &[u8] = &[0x12, 0x34, 0x04];
        assert_eq!(
            PacketHeader::deser(&mut read, TEST_PROTOCOL_ID),
            Err(DecodeError::Truncated)
        );
    }

    /// The checksum must be computable and verifiable without knowing in
    /// which order sender and receiver patch the session field.
    #[test]
    fn checksum_substitution_is_symmetric() {
        let session_id = 0xCAFE_F00D;
        let header = PacketHeader {
            flags: HeaderFlags::empty(),
            session_id,
            client_id: 3,
            sent_time: None,
        };
        let mut buf = BytesMut::new();
        header.ser(TEST_PROTOCOL_ID, &mut buf);
        buf.extend_from_slice(b"some message bytes");

        // sender: compute over the true session id, then patch it in
        let checksum = PacketHeader::checksum_with_session_id(&buf, session_id);
        let mut datagram = buf.to_vec();
        PacketHeader::patch_session_id(&mut datagram, checksum);

        // receiver: read the claimed checksum, recompute with the session id
        // it expects for this peer
        let mut read: &[u8] = &datagram;
        let received = PacketHeader::deser(&mut read, TEST_PROTOCOL_ID).unwrap();
        assert_eq!(received.session_id, checksum);
        assert_eq!(
            PacketHeader::checksum_with_session_id(&datagram, session_id),
            checksum
        );
        assert_ne!(
            PacketHeader::checksum_with_session_id(&datagram, session_id + 1),
            checksum
        );
    }
}
