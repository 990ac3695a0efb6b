//! Error types for the tunnel engine.
//!
//! These stay internal: the registry API reports failure through `bool`,
//! `Option` and [`TunnelHandle::INVALID`](crate::TunnelHandle::INVALID).

use thiserror::Error;

/// Tunnel engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Packet codec error
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Chunked transfer error
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

/// Wire decoding and encoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Packet does not start with the protocol magic
    #[error("bad magic byte: 0x{0:02X}")]
    BadMagic(u8),

    /// Unsupported protocol version
    #[error("unsupported version: {0}")]
    BadVersion(u8),

    /// Buffer shorter than a declared length requires
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Required size
        expected: usize,
        /// Actual size
        actual: usize,
    },

    /// Checksum does not bind to the expected tunnel
    #[error("crc mismatch")]
    BadCrc,

    /// Body failed to decrypt
    #[error("crypto error: {0}")]
    Crypto(#[from] plait_crypto::CryptoError),

    /// Decrypted body ended before all declared fields
    #[error("truncated {0}")]
    Truncated(&'static str),

    /// Unknown tunnel message type
    #[error("unknown tunnel message type: 0x{0:02X}")]
    UnknownMessage(u8),

    /// Field too large for its wire length prefix
    #[error("{0} too large to encode")]
    Oversize(&'static str),
}

/// Chunked transfer errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Slice index beyond the transfer
    #[error("slice {index} out of range ({count} slices)")]
    SliceOutOfRange {
        /// Offending index
        index: u32,
        /// Slice count of the transfer
        count: u32,
    },

    /// Slice length does not match its position
    #[error("slice {index} has length {actual}, expected {expected}")]
    LengthMismatch {
        /// Slice index
        index: u32,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Declared total does not match the transfer
    #[error("declared size {declared} does not match {expected}")]
    SizeMismatch {
        /// Size carried by the packet
        declared: u64,
        /// Size the transfer was created with
        expected: u64,
    },

    /// Block index does not match the one requested
    #[error("unexpected block {0}")]
    UnexpectedBlock(u32),

    /// The external writer failed
    #[error("writer failed")]
    WriterFailed,

    /// The external reader could not supply data
    #[error("reader failed")]
    ReaderFailed,

    /// Persisted control block could not be used
    #[error("control block corrupt")]
    ControlCorrupt,
}

/// Result alias for the tunnel engine
pub type Result<T> = std::result::Result<T, Error>;
