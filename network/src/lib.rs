use consensus::DecodeError;
use std::net::SocketAddr;
use thiserror::Error;

pub mod codec;
pub mod handshake;
pub mod message;
pub mod p2p;
pub mod params;

pub use codec::WireCodec;
pub use handshake::{HandshakeConfig, Peer, negotiate, negotiate_outbound};
pub use message::{
    Command, GetHeadersMessage, Inventory, InventoryType, Message, MessageHeader, NetAddr,
    VersionMessage,
};
pub use p2p::{Connection, MessageReader, MessageWriter, Timeouts};
pub use params::Network;

/// Lowest peer protocol version we sync with.
pub const MIN_PROTOCOL_VERSION: i32 = 70015;
/// Version we announce.
pub const PROTOCOL_VERSION: i32 = 70016;
/// Service bit for a full node serving blocks.
pub const NODE_NETWORK: u64 = 1;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("deadline elapsed")]
    Timeout,
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("unexpected network magic {0}")]
    InvalidMagic(String),
    #[error("checksum mismatch for '{0}' payload")]
    InvalidChecksum(String),
    #[error("payload of {0} bytes exceeds limit")]
    PayloadTooLarge(u32),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("peer protocol version {version} below minimum {minimum}")]
    UnsupportedVersion { version: i32, minimum: i32 },
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),
}

impl NetworkError {
    /// Whether dialing the same peer again can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Io(_) | Self::Timeout | Self::ConnectionClosed
        )
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    pub fn violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation(reason.into())
    }
}
