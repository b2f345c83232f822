use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::BytesMut;

use crate::message::{MessageFlags, MessageKind};
use crate::sequence::{SEQ_HIGH_BAND, SEQ_SPAN};

/// A message queued for in-order delivery to the application, possibly a
/// reassembly buffer still waiting for fragments.
pub(crate) struct IncomingMessage {
    pub kind: MessageKind,
    pub flags: MessageFlags,
    pub reliable_seq: u16,
    pub unreliable_seq: u16,
    pub fragment_count: u32,
    pub fragments_remaining: u32,
    /// One bit per received fragment, `ceil(fragment_count / 32)` words.
    pub fragment_bitmap: Vec<u32>,
    pub data: BytesMut,
    pub sender: SocketAddr,
}

impl IncomingMessage {
    pub fn unfragmented(
        kind: MessageKind,
        flags: MessageFlags,
        reliable_seq: u16,
        unreliable_seq: u16,
        payload: &[u8],
        sender: SocketAddr,
    ) -> IncomingMessage {
        IncomingMessage {
            kind,
            flags,
            reliable_seq,
            unreliable_seq,
            fragment_count: 0,
            fragments_remaining: 0,
            fragment_bitmap: Vec::new(),
            data: BytesMut::from(payload),
            sender,
        }
    }

    /// An empty reassembly buffer for a payload of `total_length` bytes
    /// arriving as `fragment_count` fragments.
    pub fn reassembly(
        flags: MessageFlags,
        start_seq: u16,
        fragment_count: u32,
        total_length: u32,
        sender: SocketAddr,
    ) -> IncomingMessage {
        IncomingMessage {
            kind: MessageKind::DataFragment,
            flags,
            reliable_seq: start_seq,
            unreliable_seq: 0,
            fragment_count,
            fragments_remaining: fragment_count,
            fragment_bitmap: vec![0; ((fragment_count + 31) / 32) as usize],
            data: BytesMut::zeroed(total_length as usize),
            sender,
        }
    }

    /// Copies one fragment into the reassembly buffer. A fragment already
    /// marked received is a no-op, so duplicate application is idempotent.
    pub fn apply_fragment(&mut self, fragment_number: u32, offset: u32, payload: &[u8]) {
        let word = (fragment_number / 32) as usize;
        let bit = 1u32 << (fragment_number % 32);
        if self.fragment_bitmap[word] & bit != 0 {
            return;
        }
        self.fragment_bitmap[word] |= bit;
        self.fragments_remaining -= 1;

        let offset = offset as usize;
        let length = payload.len().min(self.data.len() - offset);
        self.data[offset..offset + length].copy_from_slice(&payload[..length]);
    }
}

pub(crate) enum Insertion {
    Queued,
    Duplicate,
}

/// One ordered message lane within a peer. Sequence counters are per
/// channel; the control channel (0xFF) bypasses this and uses the peer's
/// own counter.
#[derive(Default)]
pub(crate) struct Channel {
    pub outgoing_reliable_seq: u16,
    pub outgoing_unreliable_seq: u16,
    /// Highest reliable sequence number already handed to the application.
    pub incoming_reliable_seq: u16,
    pub incoming_unreliable_seq: u16,
    pub incoming_reliable: VecDeque<IncomingMessage>,
    pub incoming_unreliable: VecDeque<IncomingMessage>,
}

impl Channel {
    pub fn new() -> Channel {
        Channel::default()
    }

    /// Inserts a reliable message (or fresh reassembly) in sequence order.
    ///
    /// The queue is scanned from the back, un-extending the incoming number
    /// when the scan crosses from wrapped entries back into pre-wrap ones,
    /// so mixed pre- and post-wrap entries still order correctly.
    pub fn insert_reliable(&mut self, message: IncomingMessage, extended_seq: u32) -> Insertion {
        let mut seq = extended_seq;
        let mut insert_at = 0;

        for index in (0..self.incoming_reliable.len()).rev() {
            let existing = u32::from(self.incoming_reliable[index].reliable_seq);
            if seq >= SEQ_SPAN && existing < u32::from(SEQ_HIGH_BAND) {
                seq -= SEQ_SPAN;
            }
            if existing <= seq {
                if existing == seq {
                    return Insertion::Duplicate;
                }
                insert_at = index + 1;
                break;
            }
        }

        self.incoming_reliable.insert(insert_at, message);
        Insertion::Queued
    }

    /// Inserts an unreliable message in sequence order among the unreliable
    /// entries; unsequenced entries in the same queue are skipped over.
    pub fn insert_unreliable(&mut self, message: IncomingMessage, extended_seq: u32) -> Insertion {
        let mut seq = extended_seq;
        let mut insert_at = 0;

        for index in (0..self.incoming_unreliable.len()).rev() {
            let existing = &self.incoming_unreliable[index];
            if existing.kind != MessageKind::UnreliableData {
                continue;
            }
            let existing = u32::from(existing.unreliable_seq);
            if seq >= SEQ_SPAN && existing < u32::from(SEQ_HIGH_BAND) {
                seq -= SEQ_SPAN;
            }
            if existing <= seq {
                if existing == seq {
                    return Insertion::Duplicate;
                }
                insert_at = index + 1;
                break;
            }
        }

        self.incoming_unreliable.insert(insert_at, message);
        Insertion::Queued
    }

    pub fn push_unsequenced(&mut self, message: IncomingMessage) {
        self.incoming_unreliable.push_back(message);
    }

    /// Most recent reassembly in flight for the given start sequence number.
    pub fn find_reassembly(&mut self, start_seq: u16) -> Option<&mut IncomingMessage> {
        self.incoming_reliable
            .iter_mut()
            .rev()
            .find(|message| {
                message.kind == MessageKind::DataFragment && message.reliable_seq == start_seq
            })
    }

    /// Takes the next message ready for the application, if any.
    ///
    /// Unreliable traffic goes first: an unsequenced message at the head is
    /// always deliverable, an unreliable one only once the reliable traffic
    /// it followed has been delivered. Reliable messages deliver strictly in
    /// sequence and only once fully reassembled; a reassembled payload
    /// consumes `fragment_count` sequence numbers in one step.
    pub fn take_deliverable(&mut self, is_multicast: bool) -> Option<IncomingMessage> {
        if let Some(front) = self.incoming_unreliable.front() {
            if front.kind != MessageKind::UnreliableData {
                return self.incoming_unreliable.pop_front();
            }
            if front.reliable_seq == self.incoming_reliable_seq {
                self.incoming_unreliable_seq = front.unreliable_seq;
                return self.incoming_unreliable.pop_front();
            }
        }

        if is_multicast {
            return None;
        }

        let front = self.incoming_reliable.front()?;
        if front.fragments_remaining > 0
            || front.reliable_seq != self.incoming_reliable_seq.wrapping_add(1)
        {
            return None;
        }

        self.incoming_reliable_seq = front.reliable_seq;
        if front.fragment_count > 0 {
            self.incoming_reliable_seq = self
                .incoming_reliable_seq
                .wrapping_add(front.fragment_count as u16 - 1);
        }
        self.incoming_reliable.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::extend;

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    fn reliable_msg(seq: u16) -> IncomingMessage {
        IncomingMessage::unfragmented(
            MessageKind::ReliableData,
            MessageFlags::ACKNOWLEDGE,
            seq,
            0,
            &seq.to_be_bytes(),
            addr(),
        )
    }

    fn unreliable_msg(reliable_seq: u16, unreliable_seq: u16) -> IncomingMessage {
        IncomingMessage::unfragmented(
            MessageKind::UnreliableData,
            MessageFlags::empty(),
            reliable_seq,
            unreliable_seq,
            b"u",
            addr(),
        )
    }

    #[test]
    fn out_of_order_arrivals_deliver_in_order() {
        let mut channel = Channel::new();
        for seq in [3u16, 1, 2] {
            let extended = extend(seq, channel.incoming_reliable_seq);
            assert!(matches!(
                channel.insert_reliable(reliable_msg(seq), extended),
                Insertion::Queued
            ));
        }

        for expected in 1u16..=3 {
            let delivered = channel.take_deliverable(false).unwrap();
            assert_eq!(delivered.reliable_seq, expected);
        }
        assert!(channel.take_deliverable(false).is_none());
    }

    #[test]
    fn gap_blocks_delivery() {
        let mut channel = Channel::new();
        let extended = extend(2, channel.incoming_reliable_seq);
        channel.insert_reliable(reliable_msg(2), extended);
        assert!(channel.take_deliverable(false).is_none());
    }

    #[test]
    fn queued_duplicate_is_detected() {
        let mut channel = Channel::new();
        let extended = extend(2, channel.incoming_reliable_seq);
        channel.insert_reliable(reliable_msg(2), extended);
        assert!(matches!(
            channel.insert_reliable(reliable_msg(2), extended),
            Insertion::Duplicate
        ));
    }

    #[test]
    fn unreliable_waits_for_reliable_watermark() {
        let mut channel = Channel::new();
        // sent after the reliable message with sequence number 1
        channel.insert_unreliable(unreliable_msg(1, 1), 1);
        assert!(channel.take_deliverable(false).is_none());

        let extended = extend(1, channel.incoming_reliable_seq);
        channel.insert_reliable(reliable_msg(1), extended);
        assert_eq!(channel.take_deliverable(false).unwrap().kind, MessageKind::ReliableData);
        assert_eq!(
            channel.take_deliverable(false).unwrap().kind,
            MessageKind::UnreliableData
        );
        assert_eq!(channel.incoming_unreliable_seq, 1);
    }

    #[test]
    fn unsequenced_delivers_immediately() {
        let mut channel = Channel::new();
        channel.push_unsequenced(IncomingMessage::unfragmented(
            MessageKind::UnsequencedData,
            MessageFlags::UNSEQUENCED,
            0,
            0,
            b"x",
            addr(),
        ));
        assert!(channel.take_deliverable(false).is_some());
    }

    #[test]
    fn reassembly_applies_fragments_idempotently() {
        let mut message =
            IncomingMessage::reassembly(MessageFlags::ACKNOWLEDGE, 1, 3, 10, addr());

        message.apply_fragment(1, 4, b"5678");
        message.apply_fragment(0, 0, b"1234");
        message.apply_fragment(0, 0, b"XXXX"); // duplicate, must not corrupt
        assert_eq!(message.fragments_remaining, 1);

        message.apply_fragment(2, 8, b"90");
        assert_eq!(message.fragments_remaining, 0);
        assert_eq!(&message.data[..], b"1234567890");
    }

    #[test]
    fn fragmented_delivery_consumes_fragment_count_sequence_numbers() {
        let mut channel = Channel::new();
        let mut message =
            IncomingMessage::reassembly(MessageFlags::ACKNOWLEDGE, 1, 2, 4, addr());
        message.apply_fragment(0, 0, b"ab");
        message.apply_fragment(1, 2, b"cd");

        channel.insert_reliable(message, 1);
        let delivered = channel.take_deliverable(false).unwrap();
        assert_eq!(&delivered.data[..], b"abcd");
        assert_eq!(channel.incoming_reliable_seq, 2);
    }
}
