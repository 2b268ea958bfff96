/// Error types shared across the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Framing failures while decoding an inbound update packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not even the 10-byte header is present.
    #[error("packet too short: {len} bytes, need at least 10")]
    TooShort { len: usize },

    /// The declared update count needs more bytes than were received.
    #[error("truncated packet: {declared} updates declared, need {needed} bytes, have {available}")]
    Truncated {
        declared: u16,
        needed: usize,
        available: usize,
    },
}

/// An update message that cannot be put on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// The count field is 16 bits wide.
    #[error("too many updates for one packet: {count}, at most 65535")]
    TooManyUpdates { count: usize },
}

/// A failed downstream write. The message is abandoned, the process carries on.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("write failed: {0}")]
    Io(#[from] io::Error),

    #[error("destination not connected")]
    Disconnected,
}

/// Top-level error for the relay library.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("could not connect to destination {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not join multicast group {group}: {source}")]
    JoinFailed {
        group: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("pipeline is shut down")]
    ShutDown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type RelayResult<T> = Result<T, RelayError>;
