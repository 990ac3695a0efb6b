//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Ciphertext is not a positive multiple of the block size
    #[error("ciphertext length {0} is not block aligned")]
    Misaligned(usize),

    /// Block padding is malformed after decryption
    #[error("invalid block padding")]
    InvalidPadding,

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
