use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Delivery class and processing flags of an application payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        /// Acknowledged and retransmitted until delivered or the peer dies.
        const RELIABLE    = 1 << 0;
        /// Delivered regardless of ordering, deduplicated by group id.
        const UNSEQUENCED = 1 << 1;
        /// Payload is deflated before transmission and inflated on delivery.
        const COMPRESSED  = 1 << 2;
        /// Reserved; encryption is not implemented.
        const ENCRYPTED   = 1 << 3;
    }
}

/// An application payload.
///
/// Clones share the underlying buffer, so broadcasting one packet to many
/// peers queues the same allocation many times; the buffer is freed when the
/// last clone is dropped.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Bytes,
    flags: PacketFlags,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, flags: PacketFlags) -> Packet {
        Packet {
            data: data.into(),
            flags,
        }
    }

    /// A packet delivered in order on its channel, retransmitted until acked.
    pub fn reliable(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, PacketFlags::RELIABLE)
    }

    /// A packet delivered at most once, in sequence relative to other
    /// unreliable traffic on its channel; late arrivals are dropped.
    pub fn unreliable(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, PacketFlags::empty())
    }

    /// A packet delivered at most once in whatever order it arrives.
    pub fn unsequenced(data: impl Into<Bytes>) -> Packet {
        Packet::new(data, PacketFlags::UNSEQUENCED)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn flags(&self) -> PacketFlags {
        self.flags
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }
}
