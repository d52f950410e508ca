//! Seekable write channel over a block store.
//!
//! [`StorageSeekableChannel`] keeps one block-sized buffer anchored at an
//! absolute position. Writes inside the buffer window overwrite in place;
//! moving outside it hands the buffer to a [`WriteBehavior`], which decides
//! what a write at a given offset means for the backing store.
//! [`BlockBlobWriteBehavior`] stages each buffer as a block and commits the
//! block list on close.

use async_trait::async_trait;
use azure_storage_core::error::{StorageError, StorageResult};
use azure_storage_core::models::Validate;
use bytes::Bytes;

use crate::block_blob::{BlockBlobClient, CommitBlockListOptions};
use crate::models::{
    generate_block_id, BlobWriteOptions, BlockBlobItem, DEFAULT_BLOCK_SIZE, MAX_STAGE_BLOCK_BYTES,
};

/// The store-specific half of a [`StorageSeekableChannel`].
#[async_trait]
pub trait WriteBehavior: Send {
    /// Persist `data` at absolute `offset`.
    async fn write(&mut self, data: Bytes, offset: u64) -> StorageResult<()>;

    /// Make everything written so far durable; `total_length` is the channel size.
    async fn commit(&mut self, total_length: u64) -> StorageResult<()>;

    /// Check that the channel may move its write position to `position`.
    ///
    /// `pending` is the offset and length of buffered data the channel will
    /// hand over before the move, if any. Called before any I/O.
    fn can_seek(&self, _position: u64, _pending: Option<(u64, u64)>) -> StorageResult<()> {
        Ok(())
    }
}

/// How a seekable channel treats existing blob content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum WriteMode {
    /// Replace the blob with the data written through the channel.
    #[default]
    Overwrite,
}

/// Settings for [`BlockBlobClient::open_seekable_write`].
#[derive(Debug, Clone, Default)]
pub struct SeekableWriteOptions {
    pub mode: WriteMode,
    /// Buffer and block size; defaults to [`DEFAULT_BLOCK_SIZE`].
    pub block_size: Option<usize>,
    pub write: BlobWriteOptions,
}

impl SeekableWriteOptions {
    pub(crate) fn effective_block_size(&self) -> usize {
        self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
    }
}

impl Validate for SeekableWriteOptions {
    fn validate(&self) -> StorageResult<()> {
        let block_size = self.effective_block_size();
        if block_size == 0 || block_size as u64 > MAX_STAGE_BLOCK_BYTES {
            return Err(StorageError::Builder(format!(
                "block_size must be between 1 and {MAX_STAGE_BLOCK_BYTES}, got {block_size}"
            )));
        }
        self.write.validate()
    }
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A seekable, write-only channel.
///
/// `buffer` holds the bytes at `buffer_start..buffer_start + buffer.len()`
/// that have not been handed to the behavior yet; `cursor` is the write
/// position inside it.
#[derive(Debug)]
pub struct StorageSeekableChannel<B> {
    behavior: B,
    chunk_size: usize,
    buffer: Vec<u8>,
    buffer_start: u64,
    cursor: usize,
    size: u64,
    open: bool,
}

impl<B: WriteBehavior> StorageSeekableChannel<B> {
    /// Create a channel positioned at `starting_position`.
    pub fn new(chunk_size: usize, behavior: B, starting_position: u64) -> Self {
        Self {
            behavior,
            chunk_size: chunk_size.max(1),
            buffer: Vec::new(),
            buffer_start: starting_position,
            cursor: 0,
            size: starting_position,
            open: true,
        }
    }

    pub fn behavior(&self) -> &B {
        &self.behavior
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Current absolute write position.
    pub fn position(&self) -> u64 {
        self.buffer_start + self.cursor as u64
    }

    /// Largest position written so far, including buffered data.
    pub fn size(&self) -> u64 {
        self.size.max(self.buffer_start + self.buffer.len() as u64)
    }

    /// Write all of `data` at the current position; returns the bytes written.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<usize> {
        self.ensure_open()?;

        let mut written = 0;
        while written < data.len() {
            if self.buffer.is_empty() {
                self.behavior.can_seek(self.buffer_start, None)?;
            }
            let n = (self.chunk_size - self.cursor).min(data.len() - written);
            let end = self.cursor + n;
            if end > self.buffer.len() {
                self.buffer.resize(end, 0);
            }
            self.buffer[self.cursor..end].copy_from_slice(&data[written..written + n]);
            self.cursor = end;
            written += n;

            if self.cursor == self.chunk_size {
                self.flush_buffer().await?;
            }
        }
        Ok(written)
    }

    /// Move the write position.
    ///
    /// Positions inside the buffered window are reached without I/O. Any
    /// other position must be accepted by the behavior, and only then is the
    /// buffer flushed; a rejected seek leaves the channel untouched.
    pub async fn seek(&mut self, position: u64) -> StorageResult<()> {
        self.ensure_open()?;

        let window_end = self.buffer_start + self.buffer.len() as u64;
        let in_window = position >= self.buffer_start
            && position <= window_end
            && position - self.buffer_start < self.chunk_size as u64;
        if in_window {
            self.cursor = (position - self.buffer_start) as usize;
            return Ok(());
        }

        let pending =
            (!self.buffer.is_empty()).then(|| (self.buffer_start, self.buffer.len() as u64));
        self.behavior.can_seek(position, pending)?;
        self.flush_buffer().await?;
        self.buffer_start = position;
        self.cursor = 0;
        Ok(())
    }

    /// Hand buffered data to the behavior.
    ///
    /// The write position does not move. After seeking backwards inside the
    /// buffer, the next write therefore targets data the behavior already
    /// holds, and a behavior that cannot rewrite rejects it before buffering.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        self.flush_buffer().await
    }

    /// Flush and commit. Closing a closed channel does nothing.
    pub async fn close(&mut self) -> StorageResult<()> {
        if !self.open {
            return Ok(());
        }
        self.flush_buffer().await?;
        let total_length = self.size();
        self.behavior.commit(total_length).await?;
        self.open = false;
        tracing::debug!(total_length, "seekable channel closed");
        Ok(())
    }

    async fn flush_buffer(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = Bytes::copy_from_slice(&self.buffer);
        let len = data.len() as u64;
        self.behavior.write(data, self.buffer_start).await?;

        self.size = self.size.max(self.buffer_start + len);
        self.buffer_start += self.cursor as u64;
        self.buffer.clear();
        self.cursor = 0;
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(StorageError::InvalidState("channel is closed".into()))
        }
    }
}

// ---------------------------------------------------------------------------
// Block blob behavior
// ---------------------------------------------------------------------------

/// Stages each flushed buffer as a block and commits them on close.
///
/// Block blobs cannot rewrite staged data, so writes must arrive in order:
/// every write must start exactly where the previous one ended.
#[derive(Debug)]
pub struct BlockBlobWriteBehavior {
    blob: BlockBlobClient,
    write: BlobWriteOptions,
    block_ids: Vec<String>,
    staged_length: u64,
    committed: Option<BlockBlobItem>,
}

impl BlockBlobWriteBehavior {
    pub fn new(blob: BlockBlobClient, write: BlobWriteOptions) -> Self {
        Self {
            blob,
            write,
            block_ids: Vec::new(),
            staged_length: 0,
            committed: None,
        }
    }

    /// Ids of the blocks staged so far, in blob order.
    pub fn block_ids(&self) -> &[String] {
        &self.block_ids
    }

    /// Properties of the blob once the block list is committed.
    pub fn committed_item(&self) -> Option<&BlockBlobItem> {
        self.committed.as_ref()
    }

    fn require_sequential(&self, offset: u64) -> StorageResult<()> {
        if offset == self.staged_length {
            Ok(())
        } else {
            Err(StorageError::Unsupported(format!(
                "block blob channels only write sequentially: expected offset {}, got {offset}",
                self.staged_length
            )))
        }
    }
}

#[async_trait]
impl WriteBehavior for BlockBlobWriteBehavior {
    async fn write(&mut self, data: Bytes, offset: u64) -> StorageResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.require_sequential(offset)?;

        let id = generate_block_id();
        let len = data.len() as u64;
        self.blob.stage_block(id.clone(), data).await?;
        self.block_ids.push(id);
        self.staged_length += len;
        Ok(())
    }

    async fn commit(&mut self, total_length: u64) -> StorageResult<()> {
        if total_length != self.staged_length {
            return Err(StorageError::InvalidState(format!(
                "channel size {total_length} does not match {} staged bytes",
                self.staged_length
            )));
        }

        let options = CommitBlockListOptions::builder()
            .block_ids(self.block_ids.clone())
            .write_options(self.write.clone())
            .build()?;
        let item = self
            .blob
            .commit_block_list_with_options(&options)
            .await?
            .into_value();
        self.committed = Some(item);
        Ok(())
    }

    fn can_seek(&self, position: u64, pending: Option<(u64, u64)>) -> StorageResult<()> {
        let staged_end = match pending {
            Some((offset, len)) => {
                self.require_sequential(offset)?;
                offset + len
            }
            None => self.staged_length,
        };
        if position == staged_end {
            Ok(())
        } else {
            Err(StorageError::Unsupported(format!(
                "block blob channels only write sequentially: expected position {staged_end}, got {position}"
            )))
        }
    }
}
