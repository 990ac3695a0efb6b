//! Resumable file transfers.
//!
//! A file is cut into blocks of up to 64 slices. The downloader asks for one
//! block at a time with a mask of the slices it still wants; the uploader
//! answers with those slices. Slices that extend the contiguous prefix are
//! written immediately, out-of-order slices wait in memory until the gap
//! closes. Only the current block is tracked in the receive mask: once a
//! block completes, the control block advances and earlier blocks are
//! assumed to be on disk.

use super::control::ControlBlock;
use super::io::{FileReader, FileWriter};
use crate::config::{TunnelConfig, millis};
use crate::error::TransferError;
use crate::ids::{FileHash, TaskId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

fn full_mask(slices: u32) -> u64 {
    if slices >= 64 {
        u64::MAX
    } else {
        (1u64 << slices) - 1
    }
}

/// Block and slice geometry of one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    size: u64,
    slice_size: u64,
    slices_per_block: u32,
}

impl FileLayout {
    /// Layout for `size` bytes with the configured slice and block sizes
    #[must_use]
    pub fn new(size: u64, config: &TunnelConfig) -> Self {
        Self {
            size,
            slice_size: config.file_slice_size.max(1) as u64,
            slices_per_block: config.file_slices_per_block.clamp(1, 64) as u32,
        }
    }

    /// File size
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes per block
    #[must_use]
    pub fn block_size(&self) -> u64 {
        self.slice_size * u64::from(self.slices_per_block)
    }

    /// Number of blocks (zero for an empty file)
    #[must_use]
    pub fn block_count(&self) -> u32 {
        u32::try_from(self.size.div_ceil(self.block_size())).unwrap_or(u32::MAX)
    }

    /// Slices in `block`
    #[must_use]
    pub fn slices_in_block(&self, block: u32) -> u32 {
        let start = u64::from(block) * self.block_size();
        if start >= self.size {
            return 0;
        }
        let remaining = (self.size - start).min(self.block_size());
        remaining.div_ceil(self.slice_size) as u32
    }

    /// Byte offset of a slice
    #[must_use]
    pub fn offset(&self, block: u32, slice: u32) -> u64 {
        u64::from(block) * self.block_size() + u64::from(slice) * self.slice_size
    }

    /// Exact length of a slice
    #[must_use]
    pub fn slice_len(&self, block: u32, slice: u32) -> usize {
        let offset = self.offset(block, slice);
        self.size.saturating_sub(offset).min(self.slice_size) as usize
    }

    /// Whether a persisted position lies inside this file
    #[must_use]
    pub fn is_resumable(&self, cb: ControlBlock) -> bool {
        (cb.block < self.block_count() && cb.next_slice < self.slices_in_block(cb.block))
            || (cb.block == self.block_count() && cb.next_slice == 0)
    }

    /// Bytes covered by everything before (`block`, `slice`)
    #[must_use]
    pub fn covered(&self, block: u32, slice: u32) -> u64 {
        self.offset(block, slice).min(self.size)
    }
}

/// What happened to an accepted slice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// New data stored
    Stored,
    /// Already had it, or it belongs to a finished block
    Duplicate,
    /// The slice completed its block and the control block advanced
    BlockComplete,
    /// The slice completed the file
    FileComplete,
}

#[derive(Debug, Clone, Copy)]
struct BlockRequest {
    block: u32,
    sent_ms: u64,
}

/// Download in progress
pub struct IncomingFile {
    id: TaskId,
    hash: FileHash,
    layout: FileLayout,
    writer: Box<dyn FileWriter>,
    control: ControlBlock,
    mask: u64,
    buffered: BTreeMap<u32, Vec<u8>>,
    request: Option<BlockRequest>,
    request_timeout_ms: u64,
    flush_interval_ms: u64,
    last_flush_ms: u64,
    last_progress_ms: u64,
    control_dirty: bool,
}

impl std::fmt::Debug for IncomingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingFile")
            .field("id", &self.id)
            .field("layout", &self.layout)
            .field("control", &self.control)
            .field("mask", &format_args!("{:#x}", self.mask))
            .finish_non_exhaustive()
    }
}

impl IncomingFile {
    /// Start or resume a download.
    ///
    /// A missing, corrupt or out-of-range control block restarts from zero.
    ///
    /// # Errors
    ///
    /// [`TransferError::ControlCorrupt`] if the writer cannot return its
    /// control block at all.
    pub fn new(
        id: TaskId,
        hash: FileHash,
        size: u64,
        mut writer: Box<dyn FileWriter>,
        config: &TunnelConfig,
        now_ms: u64,
    ) -> Result<Self, TransferError> {
        let layout = FileLayout::new(size, config);
        let saved = writer
            .get_control_data()
            .map_err(|_| TransferError::ControlCorrupt)?;
        let control = match saved.as_deref().map(ControlBlock::decode) {
            Some(Ok(cb)) if layout.is_resumable(cb) => cb,
            Some(_) => {
                debug!(id, "discarding unusable control block");
                ControlBlock::default()
            }
            None => ControlBlock::default(),
        };

        Ok(Self {
            id,
            hash,
            layout,
            writer,
            control,
            mask: full_mask(control.next_slice),
            buffered: BTreeMap::new(),
            request: None,
            request_timeout_ms: millis(config.file_request_timeout),
            flush_interval_ms: millis(config.control_flush_interval),
            last_flush_ms: now_ms,
            last_progress_ms: now_ms,
            control_dirty: false,
        })
    }

    /// Local download id
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Content hash
    #[must_use]
    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    /// File size
    #[must_use]
    pub fn size(&self) -> u64 {
        self.layout.size()
    }

    /// Current resume position
    #[must_use]
    pub fn control(&self) -> ControlBlock {
        self.control
    }

    /// Bytes written contiguously from the start of the file
    #[must_use]
    pub fn downloaded_bytes(&self) -> u64 {
        self.layout.covered(self.control.block, self.control.next_slice)
    }

    /// Whether every block has been received
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.control.block >= self.layout.block_count()
    }

    fn wanted_mask(&self) -> u64 {
        full_mask(self.layout.slices_in_block(self.control.block)) & !self.mask
    }

    /// Block request due now: first request, or no progress within the timeout
    pub fn next_request(&mut self, now_ms: u64) -> Option<(u32, u64)> {
        if !self.request_due(now_ms) {
            return None;
        }
        self.request = Some(BlockRequest {
            block: self.control.block,
            sent_ms: now_ms,
        });
        Some((self.control.block, self.wanted_mask()))
    }

    /// Whether a request would go out at `now_ms`
    #[must_use]
    pub fn request_due(&self, now_ms: u64) -> bool {
        !self.is_complete()
            && self.request.is_none_or(|r| {
                r.block != self.control.block
                    || now_ms.saturating_sub(r.sent_ms.max(self.last_progress_ms))
                        >= self.request_timeout_ms
            })
    }

    /// The reliable block request was lost; ask again at the next chance
    pub fn on_request_lost(&mut self) {
        self.request = None;
    }

    /// Store one slice.
    ///
    /// # Errors
    ///
    /// Out-of-range index or wrong length (ignore the slice), or
    /// [`TransferError::WriterFailed`] / [`TransferError::ControlCorrupt`]
    /// when storage fails (terminal for the download).
    pub fn accept_slice(
        &mut self,
        block: u32,
        index: u32,
        data: &[u8],
        now_ms: u64,
    ) -> Result<SliceOutcome, TransferError> {
        if block < self.control.block || self.is_complete() {
            return Ok(SliceOutcome::Duplicate);
        }
        if block > self.control.block {
            return Err(TransferError::UnexpectedBlock(block));
        }
        let count = self.layout.slices_in_block(block);
        if index >= count {
            return Err(TransferError::SliceOutOfRange { index, count });
        }
        let expected = self.layout.slice_len(block, index);
        if data.len() != expected {
            return Err(TransferError::LengthMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }
        let bit = 1u64 << index;
        if self.mask & bit != 0 {
            return Ok(SliceOutcome::Duplicate);
        }
        self.mask |= bit;
        self.last_progress_ms = now_ms;

        if index == self.control.next_slice {
            self.write_slice(index, data)?;
            while let Some(next) = self.buffered.remove(&self.control.next_slice) {
                self.write_slice(self.control.next_slice, &next)?;
            }
        } else {
            self.buffered.insert(index, data.to_vec());
        }

        if self.control.next_slice < count {
            return Ok(SliceOutcome::Stored);
        }

        self.control = ControlBlock {
            block: block + 1,
            next_slice: 0,
        };
        self.mask = 0;
        self.buffered.clear();
        self.request = None;
        self.flush_control(now_ms, true)?;
        debug!(id = self.id, block, "file block complete");
        if self.is_complete() {
            Ok(SliceOutcome::FileComplete)
        } else {
            Ok(SliceOutcome::BlockComplete)
        }
    }

    fn write_slice(&mut self, index: u32, data: &[u8]) -> Result<(), TransferError> {
        let offset = self.layout.offset(self.control.block, index);
        self.writer
            .write(offset, data)
            .map_err(|_| TransferError::WriterFailed)?;
        self.control.next_slice = index + 1;
        self.control_dirty = true;
        Ok(())
    }

    /// Persist the control block if dirty and due (or forced)
    ///
    /// # Errors
    ///
    /// [`TransferError::ControlCorrupt`] if the writer rejects it.
    pub fn flush_control(&mut self, now_ms: u64, force: bool) -> Result<(), TransferError> {
        if !self.control_dirty {
            return Ok(());
        }
        if !force && now_ms.saturating_sub(self.last_flush_ms) < self.flush_interval_ms {
            return Ok(());
        }
        self.writer
            .set_control_data(&self.control.encode())
            .map_err(|_| TransferError::ControlCorrupt)?;
        self.control_dirty = false;
        self.last_flush_ms = now_ms;
        Ok(())
    }

    /// Finalize the completed file
    ///
    /// # Errors
    ///
    /// [`TransferError::WriterFailed`] if the writer cannot finalize.
    pub fn finalize(&mut self) -> Result<(), TransferError> {
        self.writer
            .finalize_write()
            .map_err(|_| TransferError::WriterFailed)
    }

    /// Release the writer without finalizing, persisting progress first
    pub fn release(mut self) {
        if let Err(e) = self.flush_control(self.last_flush_ms, true) {
            warn!(download = self.id, error = %e, "resume state not saved");
        }
        self.writer.release();
    }

    /// Forget in-flight request state, keeping on-disk progress
    pub fn reset_progress(&mut self) {
        self.request = None;
        self.buffered.clear();
        self.mask = full_mask(self.control.next_slice);
    }
}

/// Upload answering one block request at a time
pub struct OutgoingFile {
    file: u32,
    hash: FileHash,
    layout: FileLayout,
    reader: Arc<dyn FileReader>,
    block: Option<u32>,
    block_data: Vec<u8>,
    to_send: u64,
    sent_unacked: u64,
}

impl std::fmt::Debug for OutgoingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingFile")
            .field("file", &self.file)
            .field("block", &self.block)
            .field("to_send", &format_args!("{:#x}", self.to_send))
            .field("sent_unacked", &format_args!("{:#x}", self.sent_unacked))
            .finish_non_exhaustive()
    }
}

impl OutgoingFile {
    /// Upload of `size` bytes for the peer's download `file`
    #[must_use]
    pub fn new(
        file: u32,
        hash: FileHash,
        size: u64,
        reader: Arc<dyn FileReader>,
        config: &TunnelConfig,
    ) -> Self {
        Self {
            file,
            hash,
            layout: FileLayout::new(size, config),
            reader,
            block: None,
            block_data: Vec::new(),
            to_send: 0,
            sent_unacked: 0,
        }
    }

    /// Peer's download id
    #[must_use]
    pub fn file(&self) -> u32 {
        self.file
    }

    /// Content hash
    #[must_use]
    pub fn hash(&self) -> &FileHash {
        &self.hash
    }

    /// File size
    #[must_use]
    pub fn size(&self) -> u64 {
        self.layout.size()
    }

    /// Answer a block request.
    ///
    /// # Errors
    ///
    /// [`TransferError::SliceOutOfRange`] for a block past the end, or
    /// [`TransferError::ReaderFailed`] when the data cannot be read.
    pub fn on_request(&mut self, block: u32, wanted: u64) -> Result<(), TransferError> {
        let slices = self.layout.slices_in_block(block);
        if slices == 0 {
            return Err(TransferError::SliceOutOfRange {
                index: block,
                count: self.layout.block_count(),
            });
        }
        if self.block != Some(block) {
            let offset = self.layout.offset(block, 0);
            let len = (self.layout.size() - offset).min(self.layout.block_size()) as usize;
            self.block_data = self
                .reader
                .read(offset, len)
                .map_err(|_| TransferError::ReaderFailed)?;
            if self.block_data.len() != len {
                return Err(TransferError::ReaderFailed);
            }
            self.block = Some(block);
            self.sent_unacked = 0;
        }
        self.to_send = wanted & full_mask(slices) & !self.sent_unacked;
        Ok(())
    }

    /// Next slice to send as `(block, index)`
    pub fn pull_next_slice(&mut self) -> Option<(u32, u32)> {
        let block = self.block?;
        if self.to_send == 0 {
            return None;
        }
        let index = self.to_send.trailing_zeros();
        let bit = 1u64 << index;
        self.to_send &= !bit;
        self.sent_unacked |= bit;
        Some((block, index))
    }

    /// Bytes of a slice in the cached block
    #[must_use]
    pub fn slice_data(&self, index: u32) -> &[u8] {
        let Some(block) = self.block else {
            return &[];
        };
        let start = (self.layout.offset(block, index) - self.layout.offset(block, 0)) as usize;
        let end = (start + self.layout.slice_len(block, index)).min(self.block_data.len());
        &self.block_data[start.min(end)..end]
    }

    /// A slice was acknowledged
    pub fn on_slice_acked(&mut self, block: u32, index: u32) {
        if self.block == Some(block) && index < 64 {
            self.sent_unacked &= !(1u64 << index);
        }
    }

    /// A slice was lost; queue it again
    pub fn on_slice_lost(&mut self, block: u32, index: u32) {
        if self.block != Some(block) || index >= 64 {
            return;
        }
        let bit = 1u64 << index;
        if self.sent_unacked & bit != 0 {
            self.sent_unacked &= !bit;
            self.to_send |= bit;
        }
    }
}
