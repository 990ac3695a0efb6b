//! Message and file task queues of a tunnel.
//!
//! Every reliable send records a [`SentUnit`] in the send window. When the
//! window resolves it as acked or lost, the unit routes the outcome back to
//! the transfer that produced it.

use super::message::Reliable;
use crate::config::TunnelConfig;
use crate::ids::TaskId;
use crate::transfer::{IncomingFile, IncomingMessage, OutgoingFile, OutgoingMessage, RecentIds};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// What a reliable send carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SentUnit {
    MessageSlice { message: TaskId, index: u32 },
    MessageAck { message: u32 },
    FileRequest { download: TaskId },
    FileSlice { upload: u32, block: u32, index: u32 },
    FileDone { download: TaskId },
}

/// Pending and in-progress transfers of one tunnel
#[derive(Debug)]
pub(crate) struct Tasks {
    pub outgoing: BTreeMap<TaskId, OutgoingMessage>,
    pub incoming: HashMap<u32, IncomingMessage>,
    pub delivered: RecentIds,
    pub downloads: BTreeMap<TaskId, IncomingFile>,
    pub uploads: BTreeMap<u32, OutgoingFile>,
    pub finished_uploads: RecentIds,
    pub message_acks: VecDeque<u32>,
    pub file_done: VecDeque<TaskId>,
    next_task: TaskId,
}

impl Tasks {
    pub fn new(config: &TunnelConfig) -> Self {
        Self {
            outgoing: BTreeMap::new(),
            incoming: HashMap::new(),
            delivered: RecentIds::new(config.recent_ids),
            downloads: BTreeMap::new(),
            uploads: BTreeMap::new(),
            finished_uploads: RecentIds::new(config.recent_ids),
            message_acks: VecDeque::new(),
            file_done: VecDeque::new(),
            next_task: 1,
        }
    }

    /// Allocate a task id, never zero
    pub fn allocate_id(&mut self) -> TaskId {
        let id = self.next_task;
        self.next_task = self.next_task.wrapping_add(1).max(1);
        id
    }

    /// Whether anything is queued, in flight, or being received
    pub fn is_busy(&self) -> bool {
        !self.outgoing.is_empty()
            || !self.incoming.is_empty()
            || !self.downloads.is_empty()
            || !self.uploads.is_empty()
            || !self.message_acks.is_empty()
            || !self.file_done.is_empty()
    }

    /// Next reliable unit in priority order: message slices, file requests
    /// and completions, message acks, then file slices
    pub fn next_unit(&mut self, now_ms: u64) -> Option<(SentUnit, Reliable)> {
        for (&id, msg) in &mut self.outgoing {
            if let Some(index) = msg.pull_next_slice() {
                let payload = Reliable::MessageSlice {
                    message: id,
                    total_len: msg.total_len(),
                    index,
                    data: msg.slice(index).to_vec(),
                };
                return Some((SentUnit::MessageSlice { message: id, index }, payload));
            }
        }
        for (&id, download) in &mut self.downloads {
            if let Some((block, wanted)) = download.next_request(now_ms) {
                let payload = Reliable::FileRequest {
                    file: id,
                    hash: *download.hash(),
                    size: download.size(),
                    block,
                    wanted,
                };
                return Some((SentUnit::FileRequest { download: id }, payload));
            }
        }
        if let Some(download) = self.file_done.pop_front() {
            return Some((
                SentUnit::FileDone { download },
                Reliable::FileDone { file: download },
            ));
        }
        if let Some(message) = self.message_acks.pop_front() {
            return Some((
                SentUnit::MessageAck { message },
                Reliable::MessageAck { message },
            ));
        }
        for (&upload, file) in &mut self.uploads {
            if let Some((block, index)) = file.pull_next_slice() {
                let payload = Reliable::FileSlice {
                    file: upload,
                    block,
                    index: u16::try_from(index).unwrap_or(u16::MAX),
                    data: file.slice_data(index).to_vec(),
                };
                return Some((
                    SentUnit::FileSlice {
                        upload,
                        block,
                        index,
                    },
                    payload,
                ));
            }
        }
        None
    }

    /// Route an acknowledgment; returns the cookie of a message it completed
    pub fn on_unit_acked(&mut self, unit: SentUnit) -> Option<(TaskId, u64)> {
        match unit {
            SentUnit::MessageSlice { message, index } => {
                let msg = self.outgoing.get_mut(&message)?;
                msg.on_slice_acked(index);
                self.take_if_complete(message)
            }
            SentUnit::FileSlice {
                upload,
                block,
                index,
            } => {
                if let Some(file) = self.uploads.get_mut(&upload) {
                    file.on_slice_acked(block, index);
                }
                None
            }
            SentUnit::MessageAck { .. } | SentUnit::FileRequest { .. } | SentUnit::FileDone { .. } => {
                None
            }
        }
    }

    /// Route a loss so the unit is retried at the next opportunity
    pub fn on_unit_lost(&mut self, unit: SentUnit) {
        match unit {
            SentUnit::MessageSlice { message, index } => {
                if let Some(msg) = self.outgoing.get_mut(&message) {
                    msg.on_slice_lost(index);
                }
            }
            SentUnit::MessageAck { message } => self.message_acks.push_back(message),
            SentUnit::FileRequest { download } => {
                if let Some(file) = self.downloads.get_mut(&download) {
                    file.on_request_lost();
                }
            }
            SentUnit::FileSlice {
                upload,
                block,
                index,
            } => {
                if let Some(file) = self.uploads.get_mut(&upload) {
                    file.on_slice_lost(block, index);
                }
            }
            SentUnit::FileDone { download } => self.file_done.push_back(download),
        }
    }

    /// Receiver confirmed a message; returns its cookie if now complete
    pub fn confirm_message(&mut self, message: TaskId) -> Option<(TaskId, u64)> {
        self.outgoing.get_mut(&message)?.confirm();
        self.take_if_complete(message)
    }

    fn take_if_complete(&mut self, message: TaskId) -> Option<(TaskId, u64)> {
        if self.outgoing.get(&message)?.is_complete() {
            self.outgoing
                .remove(&message)
                .map(|m| (m.id(), m.cookie()))
        } else {
            None
        }
    }

    /// Queue a receiver-side message acknowledgment once
    pub fn queue_message_ack(&mut self, message: u32) {
        if !self.message_acks.contains(&message) {
            self.message_acks.push_back(message);
        }
    }

    /// Restart delivery of outgoing work for a peer that lost its state.
    ///
    /// Task identities survive; receive-side state and uploads do not.
    pub fn reset_for_new_session(&mut self) -> Vec<OutgoingFile> {
        for msg in self.outgoing.values_mut() {
            msg.reset_progress();
        }
        for download in self.downloads.values_mut() {
            download.reset_progress();
        }
        self.incoming.clear();
        self.delivered.clear();
        self.finished_uploads.clear();
        self.message_acks.clear();
        std::mem::take(&mut self.uploads).into_values().collect()
    }
}
