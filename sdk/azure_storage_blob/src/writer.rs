//! Buffered async writer for block blobs.
//!
//! [`BlockBlobWriter`] accepts data in arbitrary pieces and uploads it as the
//! blob content. Small totals end up as a single Put Blob; larger ones are cut
//! into blocks that are staged in the background while the caller keeps
//! writing, then committed in write order on [`close`](BlockBlobWriter::close).
//!
//! ```rust,no_run
//! # use azure_storage_blob::block_blob::BlockBlobClient;
//! # async fn example(blob: &BlockBlobClient) -> azure_storage_core::error::StorageResult<()> {
//! let mut writer = blob.output_stream(true).await?;
//! writer.write(b"first line\n").await?;
//! writer.write(b"second line\n").await?;
//! let item = writer.close().await?;
//! # Ok(())
//! # }
//! ```

use azure_storage_core::client::StorageResponse;
use azure_storage_core::error::{StorageError, StorageResult};
use azure_storage_core::models::Validate;
use bytes::{Bytes, BytesMut};
use tokio::task::{JoinError, JoinSet};

use crate::block_blob::{BlockBlobClient, CommitBlockListOptions, UploadOptions};
use crate::models::{generate_block_id, BlobWriteOptions, BlockBlobItem, ParallelTransferOptions};

/// Settings for [`BlockBlobClient::output_stream_with_options`].
#[derive(Debug, Clone, Default)]
pub struct OutputStreamOptions {
    pub transfer: ParallelTransferOptions,
    pub write: BlobWriteOptions,
}

impl Validate for OutputStreamOptions {
    fn validate(&self) -> StorageResult<()> {
        self.transfer.validate()?;
        self.write.validate()
    }
}

#[derive(Debug)]
enum WriterState {
    Open,
    Failed,
    Closed(BlockBlobItem),
}

/// An async writer that uploads a block blob.
///
/// At most `max_concurrency` blocks are staged at once; `write` waits for a
/// slot when all are busy. A failure of a background stage is returned from
/// the next `write`, `flush` or `close`, after which the writer is unusable.
/// Any error leaves the writer failed, so data passed to the `write` that
/// returned it is never committed.
///
/// Dropping the writer without calling [`close`](Self::close) aborts pending
/// stages and commits nothing.
#[derive(Debug)]
pub struct BlockBlobWriter {
    blob: BlockBlobClient,
    transfer: ParallelTransferOptions,
    write: BlobWriteOptions,
    buffer: BytesMut,
    block_ids: Vec<String>,
    in_flight: JoinSet<StorageResult<()>>,
    bytes_written: u64,
    state: WriterState,
}

impl BlockBlobWriter {
    pub(crate) fn new(blob: BlockBlobClient, options: OutputStreamOptions) -> Self {
        Self {
            blob,
            transfer: options.transfer,
            write: options.write,
            buffer: BytesMut::new(),
            block_ids: Vec::new(),
            in_flight: JoinSet::new(),
            bytes_written: 0,
            state: WriterState::Open,
        }
    }

    /// Total bytes passed to successful [`write`](Self::write) calls.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Number of blocks handed to the service so far.
    pub fn blocks_staged(&self) -> usize {
        self.block_ids.len()
    }

    /// Append `data` to the blob.
    pub async fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        self.ensure_open()?;
        self.reap_finished()?;

        self.buffer.extend_from_slice(data);

        // Until the first block goes out the data may still fit a single Put Blob.
        let single_upload =
            self.block_ids.is_empty() && self.buffer.len() <= self.transfer.max_single_upload_size;
        if !single_upload {
            while self.buffer.len() >= self.transfer.block_size {
                let chunk = self.buffer.split_to(self.transfer.block_size).freeze();
                self.stage(chunk).await?;
            }
        }
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Stage any buffered data and wait for all in-flight stages.
    pub async fn flush(&mut self) -> StorageResult<()> {
        self.ensure_open()?;
        if !self.buffer.is_empty() {
            let chunk = self.buffer.split().freeze();
            self.stage(chunk).await?;
        }
        self.drain().await
    }

    /// Finish the upload and return the committed blob's properties.
    ///
    /// Calling `close` again returns the same properties without contacting
    /// the service.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::writer::close` with fields
    /// `blob` and `bytes`.
    #[tracing::instrument(
        name = "storage::block_blob::writer::close",
        skip(self),
        fields(blob = %self.blob.blob_name(), bytes = self.bytes_written)
    )]
    pub async fn close(&mut self) -> StorageResult<BlockBlobItem> {
        match &self.state {
            WriterState::Closed(item) => return Ok(item.clone()),
            WriterState::Failed => return Err(Self::failed_error()),
            WriterState::Open => {}
        }

        match self.finish().await {
            Ok(item) => {
                tracing::debug!(blocks = self.block_ids.len(), "writer closed");
                self.state = WriterState::Closed(item.clone());
                Ok(item)
            }
            Err(e) => {
                self.fail();
                Err(e)
            }
        }
    }

    async fn finish(&mut self) -> StorageResult<BlockBlobItem> {
        self.drain().await?;

        if self.block_ids.is_empty() && self.buffer.len() <= self.transfer.max_single_upload_size {
            tracing::debug!("uploading buffered data with a single request");
            let options = UploadOptions::builder()
                .data(self.buffer.split().freeze())
                .write_options(self.write.clone())
                .build()?;
            return self
                .blob
                .upload_with_options(&options)
                .await
                .map(StorageResponse::into_value);
        }

        while !self.buffer.is_empty() {
            let len = self.buffer.len().min(self.transfer.block_size);
            let chunk = self.buffer.split_to(len).freeze();
            self.stage(chunk).await?;
        }
        self.drain().await?;

        let options = CommitBlockListOptions::builder()
            .block_ids(self.block_ids.clone())
            .write_options(self.write.clone())
            .build()?;
        self.blob
            .commit_block_list_with_options(&options)
            .await
            .map(StorageResponse::into_value)
    }

    /// Spawn a stage for `chunk`, waiting for a free slot first.
    ///
    /// The id is recorded before the task starts, so `block_ids` follows
    /// write order whatever order the stages complete in.
    async fn stage(&mut self, chunk: Bytes) -> StorageResult<()> {
        while self.in_flight.len() >= self.transfer.max_concurrency {
            self.join_one().await?;
        }

        let id = generate_block_id();
        self.block_ids.push(id.clone());

        let blob = self.blob.clone();
        tracing::trace!(block_id = %id, size = chunk.len(), "spawning block stage");
        self.in_flight
            .spawn(async move { blob.stage_block(id, chunk).await });
        Ok(())
    }

    async fn join_one(&mut self) -> StorageResult<()> {
        match self.in_flight.join_next().await {
            Some(result) => self.check_task(result),
            None => Ok(()),
        }
    }

    async fn drain(&mut self) -> StorageResult<()> {
        while let Some(result) = self.in_flight.join_next().await {
            self.check_task(result)?;
        }
        Ok(())
    }

    fn reap_finished(&mut self) -> StorageResult<()> {
        while let Some(result) = self.in_flight.try_join_next() {
            self.check_task(result)?;
        }
        Ok(())
    }

    fn check_task(&mut self, result: Result<StorageResult<()>, JoinError>) -> StorageResult<()> {
        let outcome = result
            .map_err(|e| StorageError::InvalidState(format!("block stage task failed: {e}")))
            .and_then(|staged| staged);
        if let Err(e) = &outcome {
            tracing::debug!(error = %e, "block stage failed");
            self.fail();
        }
        outcome
    }

    fn fail(&mut self) {
        self.state = WriterState::Failed;
        self.in_flight.abort_all();
    }

    fn ensure_open(&self) -> StorageResult<()> {
        match self.state {
            WriterState::Open => Ok(()),
            WriterState::Failed => Err(Self::failed_error()),
            WriterState::Closed(_) => Err(StorageError::InvalidState("writer is closed".into())),
        }
    }

    fn failed_error() -> StorageError {
        StorageError::InvalidState("writer failed on an earlier operation".into())
    }
}
