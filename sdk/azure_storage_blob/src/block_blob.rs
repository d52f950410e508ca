//! Block blob client for Azure Blob Storage.
//!
//! A block blob is assembled from blocks: each block is uploaded ("staged")
//! under a base64 id, then a block list commits an ordered selection of staged
//! and previously committed blocks as the blob content. Small blobs can skip
//! staging and be written with a single Put Blob request.
//!
//! [`BlockBlobClient`] exposes both paths, plus chunked uploads
//! ([`upload_buffered`](BlockBlobClient::upload_buffered)), an async writer
//! ([`output_stream`](BlockBlobClient::output_stream)) and a seekable write
//! channel ([`open_seekable_write`](BlockBlobClient::open_seekable_write)).
//!
//! ## Example
//!
//! ```rust,no_run
//! use azure_storage_core::auth::StorageCredential;
//! use azure_storage_core::client::StorageClient;
//! use azure_storage_blob::block_blob::BlockBlobClient;
//! use azure_storage_blob::models::generate_block_id;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StorageClient::builder()
//!     .endpoint("https://myaccount.blob.core.windows.net")
//!     .credential(StorageCredential::shared_key("myaccount", "base64-account-key"))
//!     .build()?;
//!
//! let blob = BlockBlobClient::new(client, "photos", "2024/cat.jpg")?;
//!
//! let first = generate_block_id();
//! let second = generate_block_id();
//! blob.stage_block(first.clone(), b"hello ".to_vec()).await?;
//! blob.stage_block(second.clone(), b"world".to_vec()).await?;
//! let item = blob.commit_block_list(vec![first, second], true).await?;
//! println!("committed, etag {:?}", item.etag);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use azure_storage_core::client::{StorageClient, StorageRequest, StorageResponse};
use azure_storage_core::error::{StorageError, StorageResult};
use azure_storage_core::models::{headers, Validate};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::conditions::BlobRequestConditions;
use crate::models::{
    block_list_body, generate_block_id, validate_block_id, AccessTier, BlobHttpHeaders, BlobRange,
    BlobWriteOptions, BlockBlobItem, BlockList, BlockListType, CustomerProvidedKey, Metadata,
    ParallelTransferOptions, Tags, MAX_BLOCKS, MAX_STAGE_BLOCK_BYTES, MAX_UPLOAD_BLOB_BYTES,
};
use crate::seekable::{
    BlockBlobWriteBehavior, SeekableWriteOptions, StorageSeekableChannel, WriteMode,
};
use crate::writer::{BlockBlobWriter, OutputStreamOptions};

/// Characters left unescaped in container and blob path segments.
const PATH_SEGMENT_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn is_dot_segment(segment: &str) -> bool {
    matches!(segment, "." | "..")
}

fn md5_of(data: &[u8]) -> Vec<u8> {
    Md5::digest(data).to_vec()
}

fn parse_source_url(source_url: Option<String>) -> StorageResult<String> {
    let source_url = source_url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| StorageError::Builder("source_url is required".into()))?;
    Url::parse(&source_url)
        .map_err(|e| StorageError::Builder(format!("source_url is not a valid URL: {e}")))?;
    Ok(source_url)
}

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// Options for a single Put Blob request.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    data: Bytes,
    write: BlobWriteOptions,
    content_md5: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl UploadOptions {
    /// Creates a new builder for upload options.
    pub fn builder() -> UploadOptionsBuilder {
        UploadOptionsBuilder::default()
    }

    /// Returns the content to upload.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// Builder for [`UploadOptions`].
#[derive(Debug, Default)]
pub struct UploadOptionsBuilder {
    data: Option<Bytes>,
    write: BlobWriteOptions,
    content_md5: Option<Vec<u8>>,
    compute_md5: bool,
    timeout: Option<Duration>,
}

impl UploadOptionsBuilder {
    /// Sets the blob content (required, may be empty).
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Replaces all destination settings at once.
    pub fn write_options(mut self, write: BlobWriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn headers(mut self, headers: BlobHttpHeaders) -> Self {
        self.write.headers = headers;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.write.metadata = metadata;
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.write.tags = tags;
        self
    }

    pub fn tier(mut self, tier: AccessTier) -> Self {
        self.write.tier = Some(tier);
        self
    }

    pub fn conditions(mut self, conditions: BlobRequestConditions) -> Self {
        self.write.conditions = conditions;
        self
    }

    /// Sets the transactional MD5 the service verifies against the body.
    pub fn content_md5(mut self, md5: Vec<u8>) -> Self {
        self.content_md5 = Some(md5);
        self
    }

    /// Computes the transactional MD5 from the data when none is supplied.
    pub fn compute_md5(mut self, compute: bool) -> Self {
        self.compute_md5 = compute;
        self
    }

    /// Per-attempt timeout, overriding the client's read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the options, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if:
    /// - `data` is missing
    /// - `data` is larger than [`MAX_UPLOAD_BLOB_BYTES`]
    /// - metadata or tags are invalid
    pub fn build(self) -> StorageResult<UploadOptions> {
        let data = self
            .data
            .ok_or_else(|| StorageError::Builder("data is required".into()))?;

        if data.len() as u64 > MAX_UPLOAD_BLOB_BYTES {
            return Err(StorageError::Builder(format!(
                "data is {} bytes, a single upload allows at most {MAX_UPLOAD_BLOB_BYTES}",
                data.len()
            )));
        }
        self.write.validate()?;

        let content_md5 = match (self.content_md5, self.compute_md5) {
            (Some(md5), _) => Some(md5),
            (None, true) => Some(md5_of(&data)),
            (None, false) => None,
        };

        Ok(UploadOptions {
            data,
            write: self.write,
            content_md5,
            timeout: self.timeout,
        })
    }
}

/// Options for Put Blob From URL.
#[derive(Debug, Clone)]
pub struct UploadFromUrlOptions {
    source_url: String,
    write: BlobWriteOptions,
    source_conditions: BlobRequestConditions,
    copy_source_blob_properties: Option<bool>,
    source_authorization: Option<SecretString>,
    source_content_md5: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl UploadFromUrlOptions {
    /// Creates a new builder for upload-from-URL options.
    pub fn builder() -> UploadFromUrlOptionsBuilder {
        UploadFromUrlOptionsBuilder::default()
    }

    /// Returns the source URL.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

/// Builder for [`UploadFromUrlOptions`].
#[derive(Debug, Default)]
pub struct UploadFromUrlOptionsBuilder {
    source_url: Option<String>,
    write: BlobWriteOptions,
    source_conditions: BlobRequestConditions,
    copy_source_blob_properties: Option<bool>,
    source_authorization: Option<SecretString>,
    source_content_md5: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl UploadFromUrlOptionsBuilder {
    /// Sets the source blob URL (required). The source must be public or
    /// carry a SAS unless [`source_authorization`](Self::source_authorization) is set.
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Replaces all destination settings at once.
    pub fn write_options(mut self, write: BlobWriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn headers(mut self, headers: BlobHttpHeaders) -> Self {
        self.write.headers = headers;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.write.metadata = metadata;
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.write.tags = tags;
        self
    }

    pub fn tier(mut self, tier: AccessTier) -> Self {
        self.write.tier = Some(tier);
        self
    }

    /// Conditions on the destination blob.
    pub fn conditions(mut self, conditions: BlobRequestConditions) -> Self {
        self.write.conditions = conditions;
        self
    }

    /// Conditions on the source blob.
    pub fn source_conditions(mut self, conditions: BlobRequestConditions) -> Self {
        self.source_conditions = conditions;
        self
    }

    /// Whether to copy the source blob's properties to the destination.
    pub fn copy_source_blob_properties(mut self, copy: bool) -> Self {
        self.copy_source_blob_properties = Some(copy);
        self
    }

    /// Authorization for the source, e.g. `Bearer <token>`.
    pub fn source_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.source_authorization = Some(SecretString::from(authorization.into()));
        self
    }

    /// MD5 the service verifies against the source content.
    pub fn source_content_md5(mut self, md5: Vec<u8>) -> Self {
        self.source_content_md5 = Some(md5);
        self
    }

    /// Per-attempt timeout, overriding the client's read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the options, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if `source_url` is missing or not a
    /// URL, or if metadata or tags are invalid.
    pub fn build(self) -> StorageResult<UploadFromUrlOptions> {
        let source_url = parse_source_url(self.source_url)?;
        self.write.validate()?;

        Ok(UploadFromUrlOptions {
            source_url,
            write: self.write,
            source_conditions: self.source_conditions,
            copy_source_blob_properties: self.copy_source_blob_properties,
            source_authorization: self.source_authorization,
            source_content_md5: self.source_content_md5,
            timeout: self.timeout,
        })
    }
}

/// Options for Put Block.
#[derive(Debug, Clone)]
pub struct StageBlockOptions {
    block_id: String,
    data: Bytes,
    lease_id: Option<String>,
    content_md5: Option<Vec<u8>>,
    timeout: Option<Duration>,
}

impl StageBlockOptions {
    /// Creates a new builder for stage-block options.
    pub fn builder() -> StageBlockOptionsBuilder {
        StageBlockOptionsBuilder::default()
    }

    /// Returns the block id.
    pub fn block_id(&self) -> &str {
        &self.block_id
    }
}

/// Builder for [`StageBlockOptions`].
#[derive(Debug, Default)]
pub struct StageBlockOptionsBuilder {
    block_id: Option<String>,
    data: Option<Bytes>,
    lease_id: Option<String>,
    content_md5: Option<Vec<u8>>,
    compute_md5: bool,
    timeout: Option<Duration>,
}

impl StageBlockOptionsBuilder {
    /// Sets the base64 block id (required).
    pub fn block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    /// Sets the block content (required).
    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    /// Sets the transactional MD5 the service verifies against the block.
    pub fn content_md5(mut self, md5: Vec<u8>) -> Self {
        self.content_md5 = Some(md5);
        self
    }

    /// Computes the transactional MD5 from the data when none is supplied.
    pub fn compute_md5(mut self, compute: bool) -> Self {
        self.compute_md5 = compute;
        self
    }

    /// Per-attempt timeout, overriding the client's read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the options, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if:
    /// - `block_id` is missing or not valid base64 of at most 64 bytes
    /// - `data` is missing
    /// - `data` is larger than [`MAX_STAGE_BLOCK_BYTES`]
    pub fn build(self) -> StorageResult<StageBlockOptions> {
        let block_id = self
            .block_id
            .ok_or_else(|| StorageError::Builder("block_id is required".into()))?;
        validate_block_id(&block_id)?;

        let data = self
            .data
            .ok_or_else(|| StorageError::Builder("data is required".into()))?;
        if data.len() as u64 > MAX_STAGE_BLOCK_BYTES {
            return Err(StorageError::Builder(format!(
                "block is {} bytes, at most {MAX_STAGE_BLOCK_BYTES} allowed",
                data.len()
            )));
        }

        let content_md5 = match (self.content_md5, self.compute_md5) {
            (Some(md5), _) => Some(md5),
            (None, true) => Some(md5_of(&data)),
            (None, false) => None,
        };

        Ok(StageBlockOptions {
            block_id,
            data,
            lease_id: self.lease_id,
            content_md5,
            timeout: self.timeout,
        })
    }
}

/// Options for Put Block From URL.
#[derive(Debug, Clone)]
pub struct StageBlockFromUrlOptions {
    block_id: String,
    source_url: String,
    source_range: Option<BlobRange>,
    source_content_md5: Option<Vec<u8>>,
    lease_id: Option<String>,
    source_conditions: BlobRequestConditions,
    source_authorization: Option<SecretString>,
    timeout: Option<Duration>,
}

impl StageBlockFromUrlOptions {
    /// Creates a new builder for stage-block-from-URL options.
    pub fn builder() -> StageBlockFromUrlOptionsBuilder {
        StageBlockFromUrlOptionsBuilder::default()
    }

    /// Returns the block id.
    pub fn block_id(&self) -> &str {
        &self.block_id
    }
}

/// Builder for [`StageBlockFromUrlOptions`].
#[derive(Debug, Default)]
pub struct StageBlockFromUrlOptionsBuilder {
    block_id: Option<String>,
    source_url: Option<String>,
    source_range: Option<BlobRange>,
    source_content_md5: Option<Vec<u8>>,
    lease_id: Option<String>,
    source_conditions: BlobRequestConditions,
    source_authorization: Option<SecretString>,
    timeout: Option<Duration>,
}

impl StageBlockFromUrlOptionsBuilder {
    /// Sets the base64 block id (required).
    pub fn block_id(mut self, block_id: impl Into<String>) -> Self {
        self.block_id = Some(block_id.into());
        self
    }

    /// Sets the source blob URL (required).
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    /// Range of the source to copy; the whole source when unset.
    pub fn source_range(mut self, range: BlobRange) -> Self {
        self.source_range = Some(range);
        self
    }

    pub fn source_content_md5(mut self, md5: Vec<u8>) -> Self {
        self.source_content_md5 = Some(md5);
        self
    }

    /// Lease on the destination blob.
    pub fn lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    pub fn source_conditions(mut self, conditions: BlobRequestConditions) -> Self {
        self.source_conditions = conditions;
        self
    }

    pub fn source_authorization(mut self, authorization: impl Into<String>) -> Self {
        self.source_authorization = Some(SecretString::from(authorization.into()));
        self
    }

    /// Per-attempt timeout, overriding the client's read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the options, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if the block id or source URL is
    /// missing or malformed, or the source range is empty.
    pub fn build(self) -> StorageResult<StageBlockFromUrlOptions> {
        let block_id = self
            .block_id
            .ok_or_else(|| StorageError::Builder("block_id is required".into()))?;
        validate_block_id(&block_id)?;
        let source_url = parse_source_url(self.source_url)?;
        if let Some(range) = &self.source_range {
            range.validate()?;
        }

        Ok(StageBlockFromUrlOptions {
            block_id,
            source_url,
            source_range: self.source_range,
            source_content_md5: self.source_content_md5,
            lease_id: self.lease_id,
            source_conditions: self.source_conditions,
            source_authorization: self.source_authorization,
            timeout: self.timeout,
        })
    }
}

/// Options for Get Block List.
#[derive(Debug, Clone, Default)]
pub struct ListBlocksOptions {
    pub list_type: BlockListType,
    pub lease_id: Option<String>,
    /// Per-attempt timeout; the client's read timeout when unset.
    pub timeout: Option<Duration>,
}

/// Options for Put Block List.
#[derive(Debug, Clone)]
pub struct CommitBlockListOptions {
    block_ids: Vec<String>,
    write: BlobWriteOptions,
    timeout: Option<Duration>,
}

impl CommitBlockListOptions {
    /// Creates a new builder for commit options.
    pub fn builder() -> CommitBlockListOptionsBuilder {
        CommitBlockListOptionsBuilder::default()
    }

    /// Returns the block ids in commit order.
    pub fn block_ids(&self) -> &[String] {
        &self.block_ids
    }
}

/// Builder for [`CommitBlockListOptions`].
#[derive(Debug, Default)]
pub struct CommitBlockListOptionsBuilder {
    block_ids: Option<Vec<String>>,
    write: BlobWriteOptions,
    timeout: Option<Duration>,
}

impl CommitBlockListOptionsBuilder {
    /// Sets the block ids in the order they form the blob (required).
    ///
    /// An empty list commits an empty blob.
    pub fn block_ids(mut self, block_ids: Vec<String>) -> Self {
        self.block_ids = Some(block_ids);
        self
    }

    /// Replaces all destination settings at once.
    pub fn write_options(mut self, write: BlobWriteOptions) -> Self {
        self.write = write;
        self
    }

    pub fn headers(mut self, headers: BlobHttpHeaders) -> Self {
        self.write.headers = headers;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.write.metadata = metadata;
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.write.tags = tags;
        self
    }

    pub fn tier(mut self, tier: AccessTier) -> Self {
        self.write.tier = Some(tier);
        self
    }

    pub fn conditions(mut self, conditions: BlobRequestConditions) -> Self {
        self.write.conditions = conditions;
        self
    }

    /// Per-attempt timeout, overriding the client's read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the options, validating all fields.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if:
    /// - `block_ids` is missing or has more than [`MAX_BLOCKS`] entries
    /// - any block id is malformed
    /// - metadata or tags are invalid
    pub fn build(self) -> StorageResult<CommitBlockListOptions> {
        let block_ids = self
            .block_ids
            .ok_or_else(|| StorageError::Builder("block_ids is required".into()))?;
        if block_ids.len() > MAX_BLOCKS {
            return Err(StorageError::Builder(format!(
                "{} block ids given, a blob has at most {MAX_BLOCKS} blocks",
                block_ids.len()
            )));
        }
        for id in &block_ids {
            validate_block_id(id)?;
        }
        self.write.validate()?;

        Ok(CommitBlockListOptions {
            block_ids,
            write: self.write,
            timeout: self.timeout,
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A client bound to one block blob.
///
/// Cheap to clone; clones share the underlying HTTP connection pool.
#[derive(Debug, Clone)]
pub struct BlockBlobClient {
    client: StorageClient,
    container: String,
    blob: String,
    encryption_scope: Option<String>,
    customer_provided_key: Option<CustomerProvidedKey>,
}

impl BlockBlobClient {
    /// Create a client for `blob` in `container`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if either name is empty, the
    /// container name contains `/`, or any `/`-separated part of either name
    /// is `.` or `..`. URL resolution would otherwise move such requests to
    /// another blob or container.
    pub fn new(
        client: StorageClient,
        container: impl Into<String>,
        blob: impl Into<String>,
    ) -> StorageResult<Self> {
        let container = container.into();
        let blob = blob.into();
        if container.is_empty() {
            return Err(StorageError::Builder("container name is required".into()));
        }
        if container.contains('/') || is_dot_segment(&container) {
            return Err(StorageError::Builder(format!(
                "invalid container name '{container}'"
            )));
        }
        if blob.is_empty() {
            return Err(StorageError::Builder("blob name is required".into()));
        }
        if blob.split('/').any(is_dot_segment) {
            return Err(StorageError::Builder(format!(
                "blob name '{blob}' contains a '.' or '..' segment"
            )));
        }
        Ok(Self {
            client,
            container,
            blob,
            encryption_scope: None,
            customer_provided_key: None,
        })
    }

    /// A client for the same blob that encrypts writes with `scope`.
    pub fn with_encryption_scope(&self, scope: impl Into<String>) -> Self {
        Self {
            encryption_scope: Some(scope.into()),
            ..self.clone()
        }
    }

    /// A client for the same blob that encrypts writes with a customer key.
    pub fn with_customer_provided_key(&self, key: CustomerProvidedKey) -> Self {
        Self {
            customer_provided_key: Some(key),
            ..self.clone()
        }
    }

    pub fn container_name(&self) -> &str {
        &self.container
    }

    pub fn blob_name(&self) -> &str {
        &self.blob
    }

    pub fn encryption_scope(&self) -> Option<&str> {
        self.encryption_scope.as_deref()
    }

    pub fn customer_provided_key(&self) -> Option<&CustomerProvidedKey> {
        self.customer_provided_key.as_ref()
    }

    /// The underlying storage client.
    pub fn client(&self) -> &StorageClient {
        &self.client
    }

    /// The full URL of the blob.
    pub fn url(&self) -> StorageResult<Url> {
        self.client.url(&self.path())
    }

    /// Endpoint-relative, percent-encoded path. `/` in blob names is kept
    /// as a virtual directory separator.
    fn path(&self) -> String {
        let blob = self
            .blob
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT_ENCODE_SET).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!(
            "{}/{blob}",
            utf8_percent_encode(&self.container, PATH_SEGMENT_ENCODE_SET)
        )
    }

    fn apply_encryption(&self, mut request: StorageRequest) -> StorageRequest {
        request = request.header_opt("x-ms-encryption-scope", self.encryption_scope.clone());
        match &self.customer_provided_key {
            Some(key) => key.apply(request),
            None => request,
        }
    }

    // -----------------------------------------------------------------------
    // Put Blob
    // -----------------------------------------------------------------------

    /// Upload `data` as the whole blob content with a single request.
    ///
    /// With `overwrite = false` the request carries `If-None-Match: *` and
    /// fails with `BlobAlreadyExists` if the blob exists.
    pub async fn upload(
        &self,
        data: impl Into<Bytes>,
        overwrite: bool,
    ) -> StorageResult<BlockBlobItem> {
        let mut builder = UploadOptions::builder().data(data);
        if !overwrite {
            builder = builder.conditions(BlobRequestConditions::if_not_exists());
        }
        self.upload_with_options(&builder.build()?)
            .await
            .map(StorageResponse::into_value)
    }

    /// Upload with full control over headers, metadata, tags, tier and conditions.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::upload` with fields
    /// `container`, `blob` and `size`.
    #[tracing::instrument(
        name = "storage::block_blob::upload",
        skip(self, options),
        fields(container = %self.container, blob = %self.blob, size = options.data.len())
    )]
    pub async fn upload_with_options(
        &self,
        options: &UploadOptions,
    ) -> StorageResult<StorageResponse<BlockBlobItem>> {
        tracing::debug!("uploading block blob");

        let mut request = StorageRequest::put(self.path())
            .header("x-ms-blob-type", "BlockBlob")
            .header_opt(
                headers::CONTENT_MD5,
                options.content_md5.as_ref().map(|md5| BASE64_STANDARD.encode(md5)),
            )
            .body(options.data.clone())
            .timeout(options.timeout);
        request = options.write.apply(request);
        request = self.apply_encryption(request);

        let response = self.client.send(request).await?;
        let item = BlockBlobItem::from_headers(response.headers());

        tracing::debug!(etag = ?item.etag, "block blob uploaded");
        Ok(StorageResponse::new(&response, item))
    }

    // -----------------------------------------------------------------------
    // Put Blob From URL
    // -----------------------------------------------------------------------

    /// Create the blob from the content of `source_url`.
    pub async fn upload_from_url(
        &self,
        source_url: impl Into<String>,
        overwrite: bool,
    ) -> StorageResult<BlockBlobItem> {
        let mut builder = UploadFromUrlOptions::builder().source_url(source_url);
        if !overwrite {
            builder = builder.conditions(BlobRequestConditions::if_not_exists());
        }
        self.upload_from_url_with_options(&builder.build()?)
            .await
            .map(StorageResponse::into_value)
    }

    /// Put Blob From URL with destination and source conditions.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::upload_from_url`.
    #[tracing::instrument(
        name = "storage::block_blob::upload_from_url",
        skip(self, options),
        fields(container = %self.container, blob = %self.blob)
    )]
    pub async fn upload_from_url_with_options(
        &self,
        options: &UploadFromUrlOptions,
    ) -> StorageResult<StorageResponse<BlockBlobItem>> {
        tracing::debug!("uploading block blob from url");

        let mut request = StorageRequest::put(self.path())
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-copy-source", options.source_url.as_str())
            .header_opt(
                "x-ms-copy-source-blob-properties",
                options.copy_source_blob_properties.map(|b| b.to_string()),
            )
            .header_opt(
                "x-ms-copy-source-authorization",
                options
                    .source_authorization
                    .as_ref()
                    .map(|auth| auth.expose_secret().to_string()),
            )
            .header_opt(
                "x-ms-source-content-md5",
                options
                    .source_content_md5
                    .as_ref()
                    .map(|md5| BASE64_STANDARD.encode(md5)),
            )
            .body(Bytes::new())
            .timeout(options.timeout);
        request = options.write.apply(request);
        request = options.source_conditions.apply_as_source(request);
        request = self.apply_encryption(request);

        let response = self.client.send(request).await?;
        let item = BlockBlobItem::from_headers(response.headers());

        tracing::debug!(etag = ?item.etag, "block blob uploaded from url");
        Ok(StorageResponse::new(&response, item))
    }

    // -----------------------------------------------------------------------
    // Put Block / Put Block From URL
    // -----------------------------------------------------------------------

    /// Stage `data` as an uncommitted block named `block_id`.
    pub async fn stage_block(
        &self,
        block_id: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> StorageResult<()> {
        let options = StageBlockOptions::builder()
            .block_id(block_id)
            .data(data)
            .build()?;
        self.stage_block_with_options(&options)
            .await
            .map(StorageResponse::into_value)
    }

    /// Put Block with lease and transactional MD5.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::stage_block` with fields
    /// `block_id` and `size`.
    #[tracing::instrument(
        name = "storage::block_blob::stage_block",
        skip(self, options),
        fields(blob = %self.blob, block_id = %options.block_id, size = options.data.len())
    )]
    pub async fn stage_block_with_options(
        &self,
        options: &StageBlockOptions,
    ) -> StorageResult<StorageResponse<()>> {
        tracing::trace!("staging block");

        let mut request = StorageRequest::put(self.path())
            .query("comp", "block")
            .query("blockid", options.block_id.as_str())
            .header_opt(headers::LEASE_ID, options.lease_id.clone())
            .header_opt(
                headers::CONTENT_MD5,
                options.content_md5.as_ref().map(|md5| BASE64_STANDARD.encode(md5)),
            )
            .body(options.data.clone())
            .timeout(options.timeout);
        request = self.apply_encryption(request);

        let response = self.client.send(request).await?;

        tracing::trace!("block staged");
        Ok(StorageResponse::new(&response, ()))
    }

    /// Stage a block whose content is read from `source_url`.
    pub async fn stage_block_from_url(
        &self,
        block_id: impl Into<String>,
        source_url: impl Into<String>,
        source_range: Option<BlobRange>,
    ) -> StorageResult<()> {
        let mut builder = StageBlockFromUrlOptions::builder()
            .block_id(block_id)
            .source_url(source_url);
        if let Some(range) = source_range {
            builder = builder.source_range(range);
        }
        self.stage_block_from_url_with_options(&builder.build()?)
            .await
            .map(StorageResponse::into_value)
    }

    /// Put Block From URL with source range, MD5 and conditions.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::stage_block_from_url`.
    #[tracing::instrument(
        name = "storage::block_blob::stage_block_from_url",
        skip(self, options),
        fields(blob = %self.blob, block_id = %options.block_id)
    )]
    pub async fn stage_block_from_url_with_options(
        &self,
        options: &StageBlockFromUrlOptions,
    ) -> StorageResult<StorageResponse<()>> {
        tracing::debug!("staging block from url");

        let mut request = StorageRequest::put(self.path())
            .query("comp", "block")
            .query("blockid", options.block_id.as_str())
            .header("x-ms-copy-source", options.source_url.as_str())
            .header_opt(
                "x-ms-source-range",
                options.source_range.and_then(|r| r.to_header_value()),
            )
            .header_opt(
                "x-ms-source-content-md5",
                options
                    .source_content_md5
                    .as_ref()
                    .map(|md5| BASE64_STANDARD.encode(md5)),
            )
            .header_opt(headers::LEASE_ID, options.lease_id.clone())
            .header_opt(
                "x-ms-copy-source-authorization",
                options
                    .source_authorization
                    .as_ref()
                    .map(|auth| auth.expose_secret().to_string()),
            )
            .body(Bytes::new())
            .timeout(options.timeout);
        request = options.source_conditions.apply_as_source(request);
        request = self.apply_encryption(request);

        let response = self.client.send(request).await?;

        tracing::debug!("block staged from url");
        Ok(StorageResponse::new(&response, ()))
    }

    // -----------------------------------------------------------------------
    // Get Block List / Put Block List
    // -----------------------------------------------------------------------

    /// List the blob's blocks.
    pub async fn list_blocks(&self, list_type: BlockListType) -> StorageResult<BlockList> {
        self.list_blocks_with_options(&ListBlocksOptions {
            list_type,
            ..Default::default()
        })
        .await
        .map(StorageResponse::into_value)
    }

    /// Get Block List with a lease id.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::list_blocks` with field
    /// `list_type`.
    #[tracing::instrument(
        name = "storage::block_blob::list_blocks",
        skip(self, options),
        fields(blob = %self.blob, list_type = options.list_type.as_str())
    )]
    pub async fn list_blocks_with_options(
        &self,
        options: &ListBlocksOptions,
    ) -> StorageResult<StorageResponse<BlockList>> {
        tracing::debug!("listing blocks");

        let request = StorageRequest::get(self.path())
            .query("comp", "blocklist")
            .query("blocklisttype", options.list_type.as_str())
            .header_opt(headers::LEASE_ID, options.lease_id.clone())
            .timeout(options.timeout);

        let response = self.client.send(request).await?;
        let meta = StorageResponse::new(&response, ());
        let body = response.text().await?;
        let list = BlockList::from_response(meta.headers(), &body)?;

        tracing::debug!(
            committed = list.committed.len(),
            uncommitted = list.uncommitted.len(),
            "blocks listed"
        );
        Ok(meta.map(|()| list))
    }

    /// Commit `block_ids`, in order, as the blob content.
    ///
    /// With `overwrite = false` the commit fails if the blob already exists.
    pub async fn commit_block_list(
        &self,
        block_ids: Vec<String>,
        overwrite: bool,
    ) -> StorageResult<BlockBlobItem> {
        let mut builder = CommitBlockListOptions::builder().block_ids(block_ids);
        if !overwrite {
            builder = builder.conditions(BlobRequestConditions::if_not_exists());
        }
        self.commit_block_list_with_options(&builder.build()?)
            .await
            .map(StorageResponse::into_value)
    }

    /// Put Block List with headers, metadata, tags, tier and conditions.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::commit_block_list` with field
    /// `blocks`.
    #[tracing::instrument(
        name = "storage::block_blob::commit_block_list",
        skip(self, options),
        fields(container = %self.container, blob = %self.blob, blocks = options.block_ids.len())
    )]
    pub async fn commit_block_list_with_options(
        &self,
        options: &CommitBlockListOptions,
    ) -> StorageResult<StorageResponse<BlockBlobItem>> {
        tracing::debug!("committing block list");

        let mut request = StorageRequest::put(self.path())
            .query("comp", "blocklist")
            .header("Content-Type", "application/xml")
            .body(block_list_body(&options.block_ids))
            .timeout(options.timeout);
        request = options.write.apply(request);
        request = self.apply_encryption(request);

        let response = self.client.send(request).await?;
        let item = BlockBlobItem::from_headers(response.headers());

        tracing::debug!(etag = ?item.etag, "block list committed");
        Ok(StorageResponse::new(&response, item))
    }

    // -----------------------------------------------------------------------
    // Exists
    // -----------------------------------------------------------------------

    /// Returns `true` if the blob exists.
    ///
    /// A blob encrypted with a customer-provided key answers a request
    /// without the key with `409 BlobUsesCustomerSpecifiedEncryption`; that
    /// also counts as existing.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::exists`.
    #[tracing::instrument(
        name = "storage::block_blob::exists",
        skip(self),
        fields(container = %self.container, blob = %self.blob)
    )]
    pub async fn exists(&self) -> StorageResult<bool> {
        let mut request = StorageRequest::head(self.path());
        if let Some(key) = &self.customer_provided_key {
            request = key.apply(request);
        }

        match self.client.send(request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) if e.error_code() == Some("BlobUsesCustomerSpecifiedEncryption") => Ok(true),
            Err(e) => Err(e),
        }
    }

    // -----------------------------------------------------------------------
    // Buffered uploads
    // -----------------------------------------------------------------------

    /// Upload `data`, splitting it into blocks when it is larger than
    /// `transfer.max_single_upload_size`.
    ///
    /// Blocks are staged with at most `transfer.max_concurrency` requests in
    /// flight and committed in data order once all have been staged.
    ///
    /// # Tracing
    ///
    /// Emits a span named `storage::block_blob::upload_buffered` with field
    /// `size`.
    #[tracing::instrument(
        name = "storage::block_blob::upload_buffered",
        skip(self, data, transfer, options),
        fields(container = %self.container, blob = %self.blob, size = tracing::field::Empty)
    )]
    pub async fn upload_buffered(
        &self,
        data: impl Into<Bytes>,
        transfer: ParallelTransferOptions,
        options: BlobWriteOptions,
    ) -> StorageResult<BlockBlobItem> {
        let data: Bytes = data.into();
        tracing::Span::current().record("size", data.len());
        transfer.validate()?;
        options.validate()?;

        if data.len() <= transfer.max_single_upload_size {
            tracing::debug!("data fits a single upload");
            let upload = UploadOptions::builder()
                .data(data)
                .write_options(options)
                .build()?;
            return self
                .upload_with_options(&upload)
                .await
                .map(StorageResponse::into_value);
        }

        let block_count = data.len().div_ceil(transfer.block_size);
        if block_count > MAX_BLOCKS {
            return Err(StorageError::Builder(format!(
                "{} bytes at block size {} needs {block_count} blocks, at most {MAX_BLOCKS} allowed",
                data.len(),
                transfer.block_size
            )));
        }

        let blocks: Vec<(String, Bytes)> = (0..block_count)
            .map(|i| {
                let start = i * transfer.block_size;
                let end = (start + transfer.block_size).min(data.len());
                (generate_block_id(), data.slice(start..end))
            })
            .collect();
        let block_ids: Vec<String> = blocks.iter().map(|(id, _)| id.clone()).collect();

        tracing::debug!(blocks = block_count, "staging blocks");
        futures::stream::iter(blocks)
            .map(|(id, chunk)| self.stage_block(id, chunk))
            .buffer_unordered(transfer.max_concurrency)
            .try_collect::<()>()
            .await?;

        let commit = CommitBlockListOptions::builder()
            .block_ids(block_ids)
            .write_options(options)
            .build()?;
        self.commit_block_list_with_options(&commit)
            .await
            .map(StorageResponse::into_value)
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    /// Open an async writer that uploads the blob as data is written.
    ///
    /// With `overwrite = false`, fails with `BlobAlreadyExists` if the blob
    /// exists now, and the final commit carries `If-None-Match: *` so a blob
    /// created concurrently is not replaced.
    pub async fn output_stream(&self, overwrite: bool) -> StorageResult<BlockBlobWriter> {
        let mut options = OutputStreamOptions::default();
        if !overwrite {
            if self.exists().await? {
                return Err(StorageError::Api {
                    status: 409,
                    code: "BlobAlreadyExists".into(),
                    message: "The specified blob already exists.".into(),
                });
            }
            options.write.conditions = BlobRequestConditions::if_not_exists();
        }
        self.output_stream_with_options(options)
    }

    /// Open an async writer with explicit transfer and destination settings.
    pub fn output_stream_with_options(
        &self,
        options: OutputStreamOptions,
    ) -> StorageResult<BlockBlobWriter> {
        options.validate()?;
        Ok(BlockBlobWriter::new(self.clone(), options))
    }

    /// Open a seekable write channel over the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Builder`] if the block size or destination
    /// settings are invalid.
    pub fn open_seekable_write(
        &self,
        options: SeekableWriteOptions,
    ) -> StorageResult<StorageSeekableChannel<BlockBlobWriteBehavior>> {
        options.validate()?;
        let block_size = options.effective_block_size();
        let behavior = match options.mode {
            WriteMode::Overwrite => BlockBlobWriteBehavior::new(self.clone(), options.write),
        };
        Ok(StorageSeekableChannel::new(block_size, behavior, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{block_ids_in_commit, setup_mock_blob};
    use std::collections::HashMap;
    use std::time::SystemTime;
    use wiremock::matchers::{
        body_string, header, header_exists, method, path as match_path, query_param,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn blob_created() -> ResponseTemplate {
        ResponseTemplate::new(201)
            .insert_header("etag", "\"0x8DB1\"")
            .insert_header("last-modified", "Mon, 02 Jan 2023 10:00:00 GMT")
            .insert_header("x-ms-request-server-encrypted", "true")
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    #[test]
    fn test_new_rejects_empty_names() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");

        assert!(BlockBlobClient::new(client.clone(), "", "b").is_err());
        assert!(BlockBlobClient::new(client, "c", "").is_err());
    }

    #[test]
    fn test_new_rejects_dot_segments() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");

        for name in ["..", ".", "../other/x", "a/../b", "a/./b", "dir/.."] {
            assert!(
                matches!(
                    BlockBlobClient::new(client.clone(), "photos", name),
                    Err(StorageError::Builder(_))
                ),
                "{name} should be rejected"
            );
        }
        for container in ["..", ".", "photos/x"] {
            assert!(matches!(
                BlockBlobClient::new(client.clone(), container, "b"),
                Err(StorageError::Builder(_))
            ));
        }
    }

    #[test]
    fn test_url_stays_inside_container() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");

        let cases = [
            ("..hidden/file.txt", "/photos/..hidden/file.txt"),
            ("dir/%2e%2e/x", "/photos/dir/%252e%252e/x"),
            ("%2E/y", "/photos/%252E/y"),
            ("a../b...", "/photos/a../b..."),
        ];
        for (name, expected) in cases {
            let blob = BlockBlobClient::new(client.clone(), "photos", name).unwrap();
            let url = blob.url().unwrap();
            assert_eq!(url.path(), expected);
            assert_eq!(url.path_segments().and_then(|mut s| s.next()), Some("photos"));
        }
    }

    #[test]
    fn test_path_encodes_segments_and_keeps_slashes() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");
        let blob = BlockBlobClient::new(client, "photos", "2024/my cat?.jpg").unwrap();

        assert_eq!(blob.path(), "photos/2024/my%20cat%3F.jpg");
        assert_eq!(
            blob.url().unwrap().as_str(),
            "https://acct.blob.core.windows.net/photos/2024/my%20cat%3F.jpg"
        );
    }

    #[test]
    fn test_upload_options_require_data() {
        let result = UploadOptions::builder().build();
        assert!(matches!(result, Err(StorageError::Builder(_))));
    }

    #[test]
    fn test_upload_options_compute_md5() {
        let options = UploadOptions::builder()
            .data("hello")
            .compute_md5(true)
            .build()
            .expect("valid options");
        assert_eq!(
            options.content_md5.as_deref(),
            Some(md5_of(b"hello").as_slice())
        );
    }

    #[test]
    fn test_stage_block_options_validate_block_id() {
        let result = StageBlockOptions::builder()
            .block_id("not base64!")
            .data("x")
            .build();
        assert!(matches!(result, Err(StorageError::Builder(_))));

        let result = StageBlockOptions::builder().data("x").build();
        assert!(matches!(result, Err(StorageError::Builder(_))));
    }

    #[test]
    fn test_stage_block_from_url_options_validate_source() {
        let result = StageBlockFromUrlOptions::builder()
            .block_id(generate_block_id())
            .source_url("not a url")
            .build();
        assert!(matches!(result, Err(StorageError::Builder(_))));

        let result = StageBlockFromUrlOptions::builder()
            .block_id(generate_block_id())
            .source_url("https://src.blob.core.windows.net/c/b")
            .source_range(BlobRange::new(0, Some(0)))
            .build();
        assert!(matches!(result, Err(StorageError::Builder(_))));
    }

    #[test]
    fn test_commit_options_limit_block_count() {
        let ids = vec![generate_block_id(); MAX_BLOCKS + 1];
        let result = CommitBlockListOptions::builder().block_ids(ids).build();
        assert!(matches!(result, Err(StorageError::Builder(_))));

        let result = CommitBlockListOptions::builder().build();
        assert!(matches!(result, Err(StorageError::Builder(_))));
    }

    #[test]
    fn test_encryption_clients_are_independent_copies() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");
        let blob = BlockBlobClient::new(client, "c", "b").unwrap();
        let scoped = blob.with_encryption_scope("scope-1");

        assert_eq!(scoped.encryption_scope(), Some("scope-1"));
        assert_eq!(blob.encryption_scope(), None);
    }

    // -----------------------------------------------------------------------
    // Put Blob
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_overwrite_sends_put_blob() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(body_string("hello world"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let item = blob.upload("hello world", true).await.expect("should upload");

        assert_eq!(item.etag.as_deref(), Some("\"0x8DB1\""));
        assert_eq!(item.is_server_encrypted, Some(true));

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("if-none-match").is_none());
    }

    #[tokio::test]
    async fn test_upload_without_overwrite_sends_if_none_match() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("if-none-match", "*"))
            .respond_with(
                ResponseTemplate::new(409)
                    .insert_header("x-ms-error-code", "BlobAlreadyExists")
                    .set_body_string(
                        "<Error><Code>BlobAlreadyExists</Code>\
                         <Message>The specified blob already exists.</Message></Error>",
                    ),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = blob.upload("data", false).await.expect_err("should fail");
        assert!(err.is_blob_already_exists());
    }

    #[tokio::test]
    async fn test_upload_with_options_sends_properties() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-blob-content-type", "text/plain"))
            .and(header("x-ms-meta-owner", "team"))
            .and(header("x-ms-tags", "env=prod"))
            .and(header("x-ms-access-tier", "Cool"))
            .and(header("If-Match", "\"0x1\""))
            .and(header("content-md5", BASE64_STANDARD.encode(md5_of(b"abc")).as_str()))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let mut metadata = Metadata::new();
        metadata.insert("owner".into(), "team".into());
        let mut tags = Tags::new();
        tags.insert("env".into(), "prod".into());

        let options = UploadOptions::builder()
            .data("abc")
            .headers(BlobHttpHeaders {
                content_type: Some("text/plain".into()),
                ..Default::default()
            })
            .metadata(metadata)
            .tags(tags)
            .tier(AccessTier::Cool)
            .conditions(BlobRequestConditions::new().with_if_match("\"0x1\""))
            .compute_md5(true)
            .build()
            .expect("valid options");

        blob.upload_with_options(&options)
            .await
            .expect("should upload");
    }

    #[tokio::test]
    async fn test_upload_with_options_returns_response_metadata() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .respond_with(blob_created().insert_header("x-ms-request-id", "req-1"))
            .expect(1)
            .mount(&server)
            .await;

        let options = UploadOptions::builder().data("abc").build().expect("valid options");
        let response = blob
            .upload_with_options(&options)
            .await
            .expect("should upload");

        assert_eq!(response.status(), 201);
        assert_eq!(response.request_id(), Some("req-1"));
        assert_eq!(response.value().etag.as_deref(), Some("\"0x8DB1\""));
    }

    #[tokio::test]
    async fn test_stage_block_honors_per_call_timeout() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(query_param("comp", "block"))
            .respond_with(ResponseTemplate::new(201).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let options = StageBlockOptions::builder()
            .block_id(generate_block_id())
            .data("chunk")
            .timeout(Duration::from_millis(200))
            .build()
            .expect("valid options");

        let start = std::time::Instant::now();
        let err = blob
            .stage_block_with_options(&options)
            .await
            .expect_err("should time out");
        assert!(matches!(err, StorageError::Request(_)), "got {err:?}");
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_encryption_headers_are_sent() {
        let server = MockServer::start().await;
        let cpk = CustomerProvidedKey::from_bytes(&[9u8; 32]);
        let blob = setup_mock_blob(&server).with_customer_provided_key(cpk.clone());

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-encryption-algorithm", "AES256"))
            .and(header("x-ms-encryption-key-sha256", cpk.key_sha256()))
            .and(header_exists("x-ms-encryption-key"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        blob.upload("x", true).await.expect("should upload");

        let scoped = setup_mock_blob(&server).with_encryption_scope("scope-1");
        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-encryption-scope", "scope-1"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        scoped.upload("y", true).await.expect("should upload");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_upload_emits_span() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .respond_with(blob_created())
            .mount(&server)
            .await;

        blob.upload("x", true).await.expect("should upload");

        assert!(logs_contain("storage::block_blob::upload"));
        assert!(logs_contain("blob.txt"));
    }

    // -----------------------------------------------------------------------
    // Put Blob From URL
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_from_url_sends_copy_source_and_source_conditions() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let source = "https://src.blob.core.windows.net/c/source.bin?sv=2023&sig=abc";

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(header("x-ms-copy-source", source))
            .and(header("x-ms-copy-source-blob-properties", "false"))
            .and(header("x-ms-source-if-match", "\"0xSRC\""))
            .and(header("if-none-match", "*"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let options = UploadFromUrlOptions::builder()
            .source_url(source)
            .conditions(BlobRequestConditions::if_not_exists())
            .source_conditions(BlobRequestConditions::new().with_if_match("\"0xSRC\""))
            .copy_source_blob_properties(false)
            .build()
            .expect("valid options");

        let response = blob
            .upload_from_url_with_options(&options)
            .await
            .expect("should upload");
        assert_eq!(response.value().etag.as_deref(), Some("\"0x8DB1\""));
    }

    #[tokio::test]
    async fn test_upload_from_url_sends_source_authorization_and_md5() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let since = SystemTime::UNIX_EPOCH + Duration::from_secs(1_672_653_600);
        let source_md5 = md5_of(b"source");

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-copy-source-authorization", "Bearer source-token"))
            .and(header(
                "x-ms-source-content-md5",
                BASE64_STANDARD.encode(&source_md5).as_str(),
            ))
            .and(header("x-ms-source-if-none-match", "\"0xOLD\""))
            .and(header("x-ms-source-if-modified-since", "Mon, 02 Jan 2023 10:00:00 GMT"))
            .and(header("x-ms-source-if-tags", "\"tier\" = 'gold'"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let options = UploadFromUrlOptions::builder()
            .source_url("https://src.blob.core.windows.net/c/source.bin")
            .source_authorization("Bearer source-token")
            .source_content_md5(source_md5)
            .source_conditions(
                BlobRequestConditions::new()
                    .with_if_none_match("\"0xOLD\"")
                    .with_if_modified_since(since)
                    .with_tags_conditions("\"tier\" = 'gold'"),
            )
            .build()
            .expect("valid options");

        assert!(!format!("{options:?}").contains("source-token"));
        blob.upload_from_url_with_options(&options)
            .await
            .expect("should upload");
    }

    // -----------------------------------------------------------------------
    // Put Block / Put Block From URL
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_stage_block_sends_comp_block() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let id = generate_block_id();

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(query_param("comp", "block"))
            .and(query_param("blockid", id.as_str()))
            .and(header("x-ms-lease-id", "lease-1"))
            .and(body_string("chunk"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let options = StageBlockOptions::builder()
            .block_id(id.clone())
            .data("chunk")
            .lease_id("lease-1")
            .build()
            .expect("valid options");
        blob.stage_block_with_options(&options)
            .await
            .expect("should stage");
    }

    #[tokio::test]
    async fn test_stage_block_propagates_md5_mismatch() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(query_param("comp", "block"))
            .respond_with(
                ResponseTemplate::new(400)
                    .insert_header("x-ms-error-code", "Md5Mismatch")
                    .set_body_string("<Error><Code>Md5Mismatch</Code><Message>mismatch</Message></Error>"),
            )
            .mount(&server)
            .await;

        let options = StageBlockOptions::builder()
            .block_id(generate_block_id())
            .data("chunk")
            .content_md5(vec![0u8; 16])
            .build()
            .expect("valid options");
        let err = blob
            .stage_block_with_options(&options)
            .await
            .expect_err("should fail");
        assert_eq!(err.error_code(), Some("Md5Mismatch"));
    }

    #[tokio::test]
    async fn test_stage_block_from_url_sends_range() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let id = generate_block_id();

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(query_param("comp", "block"))
            .and(query_param("blockid", id.as_str()))
            .and(header("x-ms-copy-source", "https://src.blob.core.windows.net/c/b"))
            .and(header("x-ms-source-range", "bytes=100-199"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        blob.stage_block_from_url(
            id,
            "https://src.blob.core.windows.net/c/b",
            Some(BlobRange::new(100, Some(100))),
        )
        .await
        .expect("should stage");
    }

    #[tokio::test]
    async fn test_stage_block_from_url_sends_source_authorization_and_conditions() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let id = generate_block_id();
        let since = SystemTime::UNIX_EPOCH + Duration::from_secs(1_672_653_600);
        let source_md5 = md5_of(b"range");

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(query_param("comp", "block"))
            .and(header("x-ms-copy-source-authorization", "Bearer source-token"))
            .and(header(
                "x-ms-source-content-md5",
                BASE64_STANDARD.encode(&source_md5).as_str(),
            ))
            .and(header("x-ms-source-if-match", "\"0xSRC\""))
            .and(header("x-ms-source-if-unmodified-since", "Mon, 02 Jan 2023 10:00:00 GMT"))
            .and(header("x-ms-lease-id", "lease-1"))
            .respond_with(ResponseTemplate::new(201).insert_header("x-ms-request-id", "req-9"))
            .expect(1)
            .mount(&server)
            .await;

        let options = StageBlockFromUrlOptions::builder()
            .block_id(id)
            .source_url("https://src.blob.core.windows.net/c/b")
            .source_authorization("Bearer source-token")
            .source_content_md5(source_md5)
            .lease_id("lease-1")
            .source_conditions(
                BlobRequestConditions::new()
                    .with_if_match("\"0xSRC\"")
                    .with_if_unmodified_since(since),
            )
            .build()
            .expect("valid options");

        assert!(!format!("{options:?}").contains("source-token"));
        let response = blob
            .stage_block_from_url_with_options(&options)
            .await
            .expect("should stage");
        assert_eq!(response.status(), 201);
        assert_eq!(response.request_id(), Some("req-9"));

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("x-ms-source-lease-id").is_none());
    }

    // -----------------------------------------------------------------------
    // Get Block List / Put Block List
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_list_blocks_parses_response() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        let body = r#"<?xml version="1.0" encoding="utf-8"?>
            <BlockList>
              <CommittedBlocks><Block><Name>QUFB</Name><Size>3</Size></Block></CommittedBlocks>
              <UncommittedBlocks><Block><Name>QkJC</Name><Size>5</Size></Block></UncommittedBlocks>
            </BlockList>"#;

        Mock::given(method("GET"))
            .and(match_path("/container/blob.txt"))
            .and(query_param("comp", "blocklist"))
            .and(query_param("blocklisttype", "all"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"0x8DB1\"")
                    .insert_header("x-ms-blob-content-length", "3")
                    .set_body_string(body),
            )
            .expect(1)
            .mount(&server)
            .await;

        let list = blob
            .list_blocks(BlockListType::All)
            .await
            .expect("should list");
        assert_eq!(list.committed[0].name, "QUFB");
        assert_eq!(list.uncommitted[0].size, 5);
        assert_eq!(list.etag.as_deref(), Some("\"0x8DB1\""));
        assert_eq!(list.blob_content_length, Some(3));
    }

    #[tokio::test]
    async fn test_commit_block_list_sends_ordered_xml() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);
        let ids = vec![generate_block_id(), generate_block_id()];

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(query_param("comp", "blocklist"))
            .and(header("content-type", "application/xml"))
            .and(body_string(block_list_body(&ids)))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let item = blob
            .commit_block_list(ids, true)
            .await
            .expect("should commit");
        assert_eq!(item.etag.as_deref(), Some("\"0x8DB1\""));
    }

    #[tokio::test]
    async fn test_commit_block_list_condition_not_met() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(query_param("comp", "blocklist"))
            .respond_with(
                ResponseTemplate::new(412).insert_header("x-ms-error-code", "ConditionNotMet"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let options = CommitBlockListOptions::builder()
            .block_ids(vec![generate_block_id()])
            .conditions(BlobRequestConditions::new().with_if_match("\"stale\""))
            .build()
            .expect("valid options");
        let err = blob
            .commit_block_list_with_options(&options)
            .await
            .expect_err("should fail");
        assert!(err.is_condition_not_met());
    }

    // -----------------------------------------------------------------------
    // Exists
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_exists_maps_404_to_false() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("HEAD"))
            .and(match_path("/container/blob.txt"))
            .respond_with(ResponseTemplate::new(404).insert_header("x-ms-error-code", "BlobNotFound"))
            .mount(&server)
            .await;

        assert!(!blob.exists().await.expect("should succeed"));
    }

    #[tokio::test]
    async fn test_exists_true_and_errors_propagate() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("HEAD"))
            .and(match_path("/container/blob.txt"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        assert!(blob.exists().await.expect("should succeed"));

        let other = BlockBlobClient::new(blob.client().clone(), "container", "denied").unwrap();
        Mock::given(method("HEAD"))
            .and(match_path("/container/denied"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        let err = other.exists().await.expect_err("should fail");
        assert_eq!(err.status(), Some(403));
    }

    #[tokio::test]
    async fn test_exists_treats_customer_key_conflict_as_existing() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("HEAD"))
            .and(match_path("/container/blob.txt"))
            .respond_with(
                ResponseTemplate::new(409)
                    .insert_header("x-ms-error-code", "BlobUsesCustomerSpecifiedEncryption"),
            )
            .mount(&server)
            .await;

        assert!(blob.exists().await.expect("should succeed"));

        let err = blob.output_stream(false).await.expect_err("should fail");
        assert!(err.is_blob_already_exists());
    }

    #[tokio::test]
    async fn test_exists_sends_customer_provided_key() {
        let server = MockServer::start().await;
        let cpk = CustomerProvidedKey::from_bytes(&[7u8; 32]);
        let blob = setup_mock_blob(&server).with_customer_provided_key(cpk.clone());

        Mock::given(method("HEAD"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-encryption-key-sha256", cpk.key_sha256()))
            .and(header("x-ms-encryption-algorithm", "AES256"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        assert!(blob.exists().await.expect("should succeed"));
    }

    // -----------------------------------------------------------------------
    // Buffered uploads
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_upload_buffered_small_data_uses_single_put() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(match_path("/container/blob.txt"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        blob.upload_buffered(
            "small",
            ParallelTransferOptions::default(),
            BlobWriteOptions::default(),
        )
        .await
        .expect("should upload");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.query().is_none());
    }

    #[tokio::test]
    async fn test_upload_buffered_stages_blocks_and_commits_in_order() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(query_param("comp", "block"))
            .respond_with(ResponseTemplate::new(201))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "blocklist"))
            .and(header("x-ms-meta-origin", "buffered"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let transfer = ParallelTransferOptions {
            block_size: 4,
            max_single_upload_size: 4,
            max_concurrency: 2,
        };
        let mut options = BlobWriteOptions::default();
        options.metadata.insert("origin".into(), "buffered".into());

        let data = b"0123456789".to_vec();
        blob.upload_buffered(data.clone(), transfer, options)
            .await
            .expect("should upload");

        let requests = server.received_requests().await.unwrap();
        let mut staged: HashMap<String, Vec<u8>> = HashMap::new();
        let mut committed = Vec::new();
        for request in &requests {
            let pairs: HashMap<_, _> = request.url.query_pairs().into_owned().collect();
            match pairs.get("comp").map(String::as_str) {
                Some("block") => {
                    staged.insert(pairs["blockid"].clone(), request.body.clone());
                }
                Some("blocklist") => {
                    committed = block_ids_in_commit(&String::from_utf8_lossy(&request.body));
                }
                _ => panic!("unexpected request {}", request.url),
            }
        }

        assert_eq!(committed.len(), 3);
        let reassembled: Vec<u8> = committed
            .iter()
            .flat_map(|id| staged[id].clone())
            .collect();
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_upload_buffered_stops_on_stage_failure() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("PUT"))
            .and(query_param("comp", "block"))
            .respond_with(ResponseTemplate::new(403).insert_header("x-ms-error-code", "AuthorizationFailure"))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("comp", "blocklist"))
            .respond_with(blob_created())
            .expect(0)
            .mount(&server)
            .await;

        let transfer = ParallelTransferOptions {
            block_size: 2,
            max_single_upload_size: 2,
            max_concurrency: 1,
        };
        let err = blob
            .upload_buffered("abcdef", transfer, BlobWriteOptions::default())
            .await
            .expect_err("should fail");
        assert_eq!(err.error_code(), Some("AuthorizationFailure"));
    }

    // -----------------------------------------------------------------------
    // Writers
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_output_stream_without_overwrite_rejects_existing_blob() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("HEAD"))
            .and(match_path("/container/blob.txt"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = blob.output_stream(false).await.expect_err("should fail");
        assert!(err.is_blob_already_exists());
    }

    #[tokio::test]
    async fn test_output_stream_without_overwrite_commits_with_if_none_match() {
        let server = MockServer::start().await;
        let blob = setup_mock_blob(&server);

        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(header("if-none-match", "*"))
            .respond_with(blob_created())
            .expect(1)
            .mount(&server)
            .await;

        let mut writer = blob.output_stream(false).await.expect("should open");
        writer.write(b"new blob").await.expect("should write");
        writer.close().await.expect("should close");
    }

    #[test]
    fn test_open_seekable_write_rejects_zero_block_size() {
        let client = azure_storage_core::client::StorageClient::builder()
            .endpoint("https://acct.blob.core.windows.net")
            .credential(azure_storage_core::auth::StorageCredential::anonymous())
            .build()
            .expect("should build");
        let blob = BlockBlobClient::new(client, "c", "b").unwrap();

        let options = SeekableWriteOptions {
            block_size: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            blob.open_seekable_write(options),
            Err(StorageError::Builder(_))
        ));
    }
}
