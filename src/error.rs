use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, XudpError>;

/// Errors surfaced to the application.
///
/// Malformed, duplicated or otherwise suspicious network input is *not* an
/// error: UDP guarantees nothing, so protocol violations are handled by
/// silently discarding data or unilaterally tearing the offending peer down.
/// What remains are socket-level faults, resource exhaustion and plain
/// caller mistakes.
#[derive(Debug, Error)]
pub enum XudpError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    #[error("all {0} peer slots are in use")]
    PeerLimitReached(u16),

    #[error("the multicast group is already joined for this endpoint")]
    MulticastGroupAlreadyJoined,

    #[error("channel id {channel} is out of range ({channel_count} channels)")]
    InvalidChannel { channel: u8, channel_count: u8 },

    #[error("peer is not connected")]
    NotConnected,

    #[error("packet of {0} bytes exceeds the maximum packet size")]
    PacketTooLarge(usize),

    #[error("operation is not supported: {0}")]
    Unsupported(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("compression error: {0}")]
    Compression(io::Error),
}

/// Failure to parse wire bytes.
///
/// Never escapes the engine; a decode failure means the rest of the datagram
/// is dropped as protocol noise.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short")]
    Truncated,

    #[error("unknown message type {0}")]
    UnknownKind(u8),

    #[error("foreign protocol id")]
    ForeignProtocol,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}
