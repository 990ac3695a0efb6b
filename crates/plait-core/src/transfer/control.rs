//! Persisted resume state of an incoming file.
//!
//! Twelve little-endian bytes: format version, current block index, next
//! contiguous slice index within that block. The writer stores the bytes
//! opaquely and hands them back on the next start.

use crate::error::TransferError;

/// Current control block format version
pub const CONTROL_VERSION: u32 = 1;

/// Encoded size
pub const CONTROL_SIZE: usize = 12;

/// Download position: everything before (`block`, `next_slice`) is on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlBlock {
    /// Block currently being received
    pub block: u32,
    /// First slice of `block` not yet written contiguously
    pub next_slice: u32,
}

impl ControlBlock {
    /// Encode to the persisted form
    #[must_use]
    pub fn encode(&self) -> [u8; CONTROL_SIZE] {
        let mut out = [0u8; CONTROL_SIZE];
        out[0..4].copy_from_slice(&CONTROL_VERSION.to_le_bytes());
        out[4..8].copy_from_slice(&self.block.to_le_bytes());
        out[8..12].copy_from_slice(&self.next_slice.to_le_bytes());
        out
    }

    /// Decode persisted bytes
    ///
    /// # Errors
    ///
    /// [`TransferError::ControlCorrupt`] on wrong length or version.
    pub fn decode(data: &[u8]) -> Result<Self, TransferError> {
        if data.len() != CONTROL_SIZE {
            return Err(TransferError::ControlCorrupt);
        }
        let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
        if word(0) != CONTROL_VERSION {
            return Err(TransferError::ControlCorrupt);
        }
        Ok(Self {
            block: word(4),
            next_slice: word(8),
        })
    }
}
