//! Instance runtime errors

use thiserror::Error;

use swarmlink_crypto::CryptoError;
use swarmlink_net::NetError;

/// Errors raised by the instance runtime
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad mac, bad ip spec, device name too long or colliding
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Device could not be opened or configured
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// No dhcp response from the rendezvous after the attempt budget
    #[error("rendezvous unreachable: {0}")]
    RendezvousUnreachable(String),

    /// Hole-punch window exhausted; peer moves to a relay path
    #[error("no direct path to peer {0}")]
    NoDirectPath(String),

    /// Every path to a peer is down
    #[error("all paths down for peer {0}")]
    AllPathsDown(String),

    /// Swarm table operation named a peer that does not exist
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Cooperative address discovery failed
    #[error("ip reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Introduction record did not parse
    #[error("malformed introduction: {0}")]
    MalformedIntroduction(String),

    /// Network layer error
    #[error(transparent)]
    Net(#[from] NetError),

    /// Crypto layer error
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Result type for instance operations
pub type CoreResult<T> = Result<T, CoreError>;
