//! Swarm key schedule for swarmlink
//!
//! Every member of a swarm shares an ordered list of symmetric keys;
//! one of them is active at a time and datagrams carry the epoch of
//! the key that sealed them. The AEAD itself is ChaCha20-Poly1305.

pub mod error;
pub mod keys;

pub use error::{CryptoError, CryptoResult};
pub use keys::{KeySchedule, SwarmKey};

/// Symmetric key size in bytes (ChaCha20-Poly1305)
pub const KEY_SIZE: usize = 32;

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Key lifetime applied when a ttl of "default" (or none) is given
pub const DEFAULT_KEY_TTL_SECS: i64 = 86_400;
