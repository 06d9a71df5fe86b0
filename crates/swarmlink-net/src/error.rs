//! Network error types

use thiserror::Error;

use swarmlink_crypto::CryptoError;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetError {
    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed datagram; the reader discards it and continues
    #[error("framing error: {0}")]
    Framing(String),

    /// Device write completed partially
    #[error("short write: wrote {written} of {expected}")]
    ShortWrite { written: usize, expected: usize },

    /// Frame exceeds the device MTU
    #[error("frame too big: {size} bytes (mtu {mtu})")]
    FrameTooBig { size: usize, mtu: usize },

    /// Address already in use
    #[error("address in use: {0}")]
    AddrInUse(std::net::SocketAddr),

    /// Device has been closed or revoked
    #[error("device closed")]
    DeviceClosed,

    /// Socket refused the operation because it was closed
    #[error("socket closed")]
    SocketClosed,

    /// Sealing a message failed (no valid key)
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for network operations
pub type NetResult<T> = Result<T, NetError>;
