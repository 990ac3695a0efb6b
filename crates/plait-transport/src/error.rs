//! Transport error types.

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// Malformed relay envelope
    #[error("bad relay envelope: {0}")]
    Relay(&'static str),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
