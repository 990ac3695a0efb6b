//! Message slicing and reassembly.

use super::slice_count;
use crate::error::TransferError;
use crate::ids::TaskId;
use std::collections::BTreeSet;

/// Outgoing message split into fixed-size slices
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    id: TaskId,
    cookie: u64,
    data: Vec<u8>,
    slice_size: usize,
    slice_count: u32,
    next_unsent: u32,
    pending: BTreeSet<u32>,
    lost: BTreeSet<u32>,
    acked: Vec<bool>,
    acked_count: u32,
    confirmed: bool,
}

impl OutgoingMessage {
    /// Slice `data` into units of `slice_size` bytes
    #[must_use]
    pub fn new(id: TaskId, cookie: u64, data: Vec<u8>, slice_size: usize) -> Self {
        let slice_count = slice_count(data.len() as u64, slice_size);
        Self {
            id,
            cookie,
            data,
            slice_size: slice_size.max(1),
            slice_count,
            next_unsent: 0,
            pending: BTreeSet::new(),
            lost: BTreeSet::new(),
            acked: vec![false; slice_count as usize],
            acked_count: 0,
            confirmed: false,
        }
    }

    /// Local task id
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Caller's completion token
    #[must_use]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Total message length
    #[must_use]
    pub fn total_len(&self) -> u32 {
        u32::try_from(self.data.len()).unwrap_or(u32::MAX)
    }

    /// Number of slices
    #[must_use]
    pub fn slice_count(&self) -> u32 {
        self.slice_count
    }

    /// Bytes of slice `index`
    #[must_use]
    pub fn slice(&self, index: u32) -> &[u8] {
        let start = (index as usize * self.slice_size).min(self.data.len());
        let end = (start + self.slice_size).min(self.data.len());
        &self.data[start..end]
    }

    /// Pick the next slice to send; known-lost slices go first
    pub fn pull_next_slice(&mut self) -> Option<u32> {
        let index = match self.lost.pop_first() {
            Some(i) => i,
            None if self.next_unsent < self.slice_count => {
                self.next_unsent += 1;
                self.next_unsent - 1
            }
            None => return None,
        };
        self.pending.insert(index);
        Some(index)
    }

    /// Slice `index` was acknowledged
    pub fn on_slice_acked(&mut self, index: u32) {
        self.pending.remove(&index);
        self.lost.remove(&index);
        if let Some(acked) = self.acked.get_mut(index as usize) {
            if !*acked {
                *acked = true;
                self.acked_count += 1;
            }
        }
    }

    /// Slice `index` was lost; it will be re-sent before new slices
    pub fn on_slice_lost(&mut self, index: u32) {
        if self.pending.remove(&index) && !self.acked.get(index as usize).copied().unwrap_or(true) {
            self.lost.insert(index);
        }
    }

    /// Whether every slice has been acknowledged
    #[must_use]
    pub fn all_acked(&self) -> bool {
        self.acked_count == self.slice_count
    }

    /// The receiver reported the message assembled
    pub fn confirm(&mut self) {
        self.confirmed = true;
    }

    /// Every slice acknowledged and the receiver confirmed assembly
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.confirmed && self.all_acked()
    }

    /// Forget delivery progress, keeping the task identity
    pub fn reset_progress(&mut self) {
        self.confirmed = false;
        self.next_unsent = 0;
        self.pending.clear();
        self.lost.clear();
        self.acked.iter_mut().for_each(|a| *a = false);
        self.acked_count = 0;
    }
}

/// Incoming message being reassembled
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    total_len: u32,
    slice_size: usize,
    slice_count: u32,
    buf: Vec<u8>,
    received: Vec<bool>,
    received_count: u32,
}

impl IncomingMessage {
    /// Pre-size a buffer for `total_len` bytes
    #[must_use]
    pub fn new(total_len: u32, slice_size: usize) -> Self {
        let slice_count = slice_count(u64::from(total_len), slice_size);
        Self {
            total_len,
            slice_size: slice_size.max(1),
            slice_count,
            buf: vec![0; total_len as usize],
            received: vec![false; slice_count as usize],
            received_count: 0,
        }
    }

    /// Declared total length
    #[must_use]
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    /// Store slice `index`.
    ///
    /// Returns `Ok(true)` for a new slice and `Ok(false)` for a duplicate.
    ///
    /// # Errors
    ///
    /// Index outside the message or a length that does not match the slot.
    pub fn accept(&mut self, index: u32, data: &[u8]) -> Result<bool, TransferError> {
        if index >= self.slice_count {
            return Err(TransferError::SliceOutOfRange {
                index,
                count: self.slice_count,
            });
        }
        let start = index as usize * self.slice_size;
        let expected = self.slice_size.min(self.buf.len() - start);
        if data.len() != expected {
            return Err(TransferError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }
        if self.received[index as usize] {
            return Ok(false);
        }
        self.buf[start..start + expected].copy_from_slice(data);
        self.received[index as usize] = true;
        self.received_count += 1;
        Ok(true)
    }

    /// Whether every slice has arrived
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.received_count == self.slice_count
    }

    /// Take the assembled bytes
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }
}
