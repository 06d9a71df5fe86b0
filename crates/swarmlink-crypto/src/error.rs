//! Crypto error types

use thiserror::Error;

/// Key schedule and cipher errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// No key in the schedule is currently valid
    #[error("no valid key in schedule")]
    NoValidKey,

    /// Datagram was sealed with a key epoch we do not hold
    #[error("unknown key epoch: {0}")]
    UnknownEpoch(u16),

    /// Authentication or decryption failure
    #[error("decryption failed")]
    DecryptFailed,

    /// Encryption failure
    #[error("encryption failed: {0}")]
    EncryptFailed(String),

    /// Key material has the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Keyfile could not be parsed
    #[error("malformed keyfile: {0}")]
    MalformedKeyfile(String),

    /// Ciphertext too short to carry nonce and tag
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
