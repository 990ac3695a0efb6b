//! Chunked transfers: messages and resumable files.
//!
//! Both variants slice a payload into fixed-size units that travel as
//! reliable tunnel messages. Outgoing state decides which unit to send next
//! (known-lost units first); incoming state reassembles and reports
//! completion.

pub mod control;
pub mod file;
pub mod io;
pub mod message;

pub use control::ControlBlock;
pub use file::{IncomingFile, OutgoingFile, SliceOutcome};
pub use io::{FileCatalog, FileReader, FileWriter, MemoryFile, MemoryReader, MemoryWriter};
pub use message::{IncomingMessage, OutgoingMessage};

use std::collections::{HashSet, VecDeque};

/// Number of fixed-size slices needed for `len` bytes (at least one)
#[must_use]
pub fn slice_count(len: u64, slice_size: usize) -> u32 {
    let slice_size = slice_size.max(1) as u64;
    u32::try_from(len.div_ceil(slice_size).max(1)).unwrap_or(u32::MAX)
}

/// Bounded set of recently finished task ids.
///
/// Answers duplicate completion claims idempotently without keeping every
/// id forever; the oldest id is forgotten first.
#[derive(Debug, Clone)]
pub struct RecentIds {
    order: VecDeque<u32>,
    set: HashSet<u32>,
    capacity: usize,
}

impl RecentIds {
    /// Set remembering at most `capacity` ids
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Remember `id`; returns `false` if it was already known
    pub fn insert(&mut self, id: u32) -> bool {
        if !self.set.insert(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        self.order.push_back(id);
        true
    }

    /// Whether `id` is remembered
    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        self.set.contains(&id)
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }
}
