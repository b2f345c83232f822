use std::time::Duration;

use crate::error::XudpError;

/// Tag string the 16-bit protocol id is derived from.
pub const PROTOCOL_TAG: &str = "XUDP";
/// Protocol version carried in the upper 6 bits of the version byte.
pub const PROTOCOL_VERSION: u8 = 1;

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 4096;
pub const DEFAULT_MTU: u16 = 1400;

/// At most this many messages are packed into one outbound datagram.
pub const MAX_MESSAGES_PER_DATAGRAM: usize = 32;

pub const MIN_WINDOW_SIZE: u32 = 4096;
pub const MAX_WINDOW_SIZE: u32 = 32768;
/// Bandwidth (bytes/sec) backing one MIN_WINDOW_SIZE worth of window.
pub const WINDOW_SIZE_SCALE: u32 = 64 * 1024;

pub const DEFAULT_CHANNEL_COUNT: u8 = 1;
pub const DEFAULT_PEER_COUNT: u16 = 16;

/// Poll slice used while servicing with no deadline, so periodic work keeps
/// running even when the socket stays quiet.
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_millis(1000);

/// The host-wide bandwidth throttle runs at most once per this interval.
pub const BANDWIDTH_THROTTLE_INTERVAL: u32 = 1000;

pub const DEFAULT_ROUND_TRIP_TIME: u32 = 500;

/// Scale of the probabilistic unreliable-send throttle; a throttle at scale
/// sheds nothing, a throttle of 0 sheds everything.
pub const PACKET_THROTTLE_SCALE: u32 = 32;
pub const DEFAULT_PACKET_THROTTLE: u32 = 32;
/// Step the shedding counter advances per unreliable payload, modulo the scale.
pub const PACKET_THROTTLE_COUNTER_STEP: u32 = 7;
pub const DEFAULT_THROTTLE_INTERVAL: u32 = 5000;
pub const DEFAULT_THROTTLE_ACCELERATION: u32 = 2;
pub const DEFAULT_THROTTLE_DECELERATION: u32 = 2;

/// Hard ceiling on the age of an unacknowledged reliable message before the
/// peer is declared dead.
pub const MAX_TIMEOUT: u32 = 30000;
/// Soft ceiling, effective once a message's RTO has stopped growing.
pub const MIN_TIMEOUT: u32 = 5000;
/// A reliable message's RTO backs off exponentially up to this multiple of
/// its initial value.
pub const RTO_LIMIT_FACTOR: u32 = 32;

/// An idle connected peer is pinged this often to keep RTT estimates and
/// NAT mappings alive.
pub const PING_INTERVAL: u32 = 500;

/// Unsequenced messages are deduplicated over a sliding window of this many
/// group numbers.
pub const UNSEQUENCED_WINDOW_SIZE: u32 = 128;
pub const UNSEQUENCED_WINDOW_WORDS: usize = (UNSEQUENCED_WINDOW_SIZE / 32) as usize;

/// Upper bound on a single application payload.
pub const MAX_PACKET_SIZE: usize = 2_000_000 * 1024;

/// Host-level configuration.
pub struct HostConfig {
    /// Peer table capacity. Also the upper bound on the client ids this host
    /// hands out, so it is part of what remote peers address us by.
    pub max_peers: u16,

    /// Downstream cap in bytes/second, 0 meaning unlimited. Advertised to
    /// peers during the handshake and fed into the fair-share allocation.
    pub incoming_bandwidth: u32,

    /// Upstream cap in bytes/second, 0 meaning unlimited.
    pub outgoing_bandwidth: u32,

    /// Assumed UDP payload capacity for outbound datagrams. There is no
    /// reliable MTU discovery over unadorned UDP, so the application carries
    /// the responsibility for choosing a size every route supports; the
    /// handshake then negotiates the minimum of both sides. Clamped to
    /// [`MIN_MTU`]..=[`MAX_MTU`].
    pub mtu: u16,

    /// When set, the session-id header field of every datagram carries a
    /// CRC32 over the whole datagram instead of the literal session id,
    /// giving integrity checking and session validation in one field. Both
    /// sides must agree on this setting.
    pub checksums: bool,

    /// TTL applied to outbound multicast traffic at bind time.
    pub multicast_ttl: u32,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            max_peers: DEFAULT_PEER_COUNT,
            incoming_bandwidth: 0,
            outgoing_bandwidth: 0,
            mtu: DEFAULT_MTU,
            checksums: false,
            multicast_ttl: 1,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), XudpError> {
        if self.max_peers == 0 || self.max_peers == u16::MAX {
            return Err(XudpError::InvalidArgument(
                "max_peers must be between 1 and 65534",
            ));
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(XudpError::InvalidArgument("mtu out of range"));
        }
        Ok(())
    }
}

/// Computes the send window a bandwidth cap can sustain.
pub(crate) fn window_for_bandwidth(bandwidth: u32) -> u32 {
    if bandwidth == 0 {
        MAX_WINDOW_SIZE
    } else {
        (bandwidth / WINDOW_SIZE_SCALE * MIN_WINDOW_SIZE).clamp(MIN_WINDOW_SIZE, MAX_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_bandwidth_gets_the_full_window() {
        assert_eq!(window_for_bandwidth(0), MAX_WINDOW_SIZE);
    }

    #[test]
    fn window_scales_with_bandwidth_between_bounds() {
        assert_eq!(window_for_bandwidth(1), MIN_WINDOW_SIZE);
        assert_eq!(window_for_bandwidth(2 * WINDOW_SIZE_SCALE), 2 * MIN_WINDOW_SIZE);
        assert_eq!(window_for_bandwidth(u32::MAX), MAX_WINDOW_SIZE);
    }
}
