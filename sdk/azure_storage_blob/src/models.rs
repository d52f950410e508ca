//! Shared types for block blob operations.
//!
//! This module contains service limits, blob properties, block list types, and
//! transfer settings used across the blob crate.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use azure_storage_core::client::StorageRequest;
use azure_storage_core::error::{StorageError, StorageResult};
use azure_storage_core::models::{
    header_base64, header_bool, header_http_date, header_str, headers, Validate,
};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::HeaderMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::conditions::BlobRequestConditions;

const MIB: u64 = 1024 * 1024;

/// Maximum size of a blob uploaded with a single Put Blob request (5000 MiB).
pub const MAX_UPLOAD_BLOB_BYTES: u64 = 5000 * MIB;

/// Maximum size of a single staged block (4000 MiB).
pub const MAX_STAGE_BLOCK_BYTES: u64 = 4000 * MIB;

/// Maximum number of blocks in a committed block blob.
pub const MAX_BLOCKS: usize = 50_000;

/// Default block size for chunked uploads (4 MiB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default threshold below which a buffered upload uses a single Put Blob (256 MiB).
pub const DEFAULT_MAX_SINGLE_UPLOAD_SIZE: usize = 256 * 1024 * 1024;

/// Default number of blocks staged concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Maximum decoded length of a block id.
pub const MAX_BLOCK_ID_BYTES: usize = 64;

/// Characters left unescaped in tag keys and values.
const TAG_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// ---------------------------------------------------------------------------
// Access tier
// ---------------------------------------------------------------------------

/// The access tier of a block blob.
///
/// The service adds tiers over time, so unknown values are preserved in
/// [`AccessTier::Other`] rather than rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AccessTier {
    Hot,
    Cool,
    Cold,
    Archive,
    Premium,
    /// A tier not known to this version of the SDK.
    Other(String),
}

impl AccessTier {
    /// Returns the wire representation of this tier.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hot => "Hot",
            Self::Cool => "Cool",
            Self::Cold => "Cold",
            Self::Archive => "Archive",
            Self::Premium => "Premium",
            Self::Other(value) => value,
        }
    }
}

impl FromStr for AccessTier {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "hot" => Self::Hot,
            "cool" => Self::Cool,
            "cold" => Self::Cold,
            "archive" => Self::Archive,
            "premium" => Self::Premium,
            _ => Self::Other(s.to_string()),
        })
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Blob properties
// ---------------------------------------------------------------------------

/// Standard HTTP properties stored with a blob.
///
/// These are sent as `x-ms-blob-*` headers and returned to readers as the
/// corresponding `Content-*` headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobHttpHeaders {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    pub content_disposition: Option<String>,
    pub cache_control: Option<String>,
    /// MD5 hash of the whole blob content, stored as a property.
    pub content_md5: Option<Vec<u8>>,
}

impl BlobHttpHeaders {
    pub(crate) fn apply(&self, request: StorageRequest) -> StorageRequest {
        request
            .header_opt("x-ms-blob-content-type", self.content_type.clone())
            .header_opt("x-ms-blob-content-encoding", self.content_encoding.clone())
            .header_opt("x-ms-blob-content-language", self.content_language.clone())
            .header_opt(
                "x-ms-blob-content-disposition",
                self.content_disposition.clone(),
            )
            .header_opt("x-ms-blob-cache-control", self.cache_control.clone())
            .header_opt(
                "x-ms-blob-content-md5",
                self.content_md5.as_ref().map(|md5| BASE64_STANDARD.encode(md5)),
            )
    }
}

/// User-defined metadata, sent as `x-ms-meta-{name}` headers.
pub type Metadata = BTreeMap<String, String>;

/// Blob index tags, sent form-url-encoded in `x-ms-tags`.
pub type Tags = BTreeMap<String, String>;

/// Check metadata names and values before they are sent as headers.
///
/// Names must be valid identifiers (ASCII letters, digits and `_`, not
/// starting with a digit). Values must not carry leading or trailing
/// whitespace, which the service would silently strip.
pub fn validate_metadata(metadata: &Metadata) -> StorageResult<()> {
    for (name, value) in metadata {
        let valid_name = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(StorageError::Builder(format!(
                "metadata name '{name}' is not a valid identifier"
            )));
        }
        if value.trim() != value {
            return Err(StorageError::Builder(format!(
                "metadata value for '{name}' has leading or trailing whitespace"
            )));
        }
        if !value.is_ascii() {
            return Err(StorageError::Builder(format!(
                "metadata value for '{name}' must be ASCII"
            )));
        }
    }
    Ok(())
}

/// Encode tags as `k1=v1&k2=v2` for the `x-ms-tags` header.
pub fn encode_tags(tags: &Tags) -> String {
    tags.iter()
        .map(|(k, v)| {
            format!(
                "{}={}",
                utf8_percent_encode(k, TAG_ENCODE_SET),
                utf8_percent_encode(v, TAG_ENCODE_SET)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Destination settings shared by every operation that creates or replaces
/// blob content: Put Blob, Put Blob From URL, Put Block List, and the
/// streaming writers.
#[derive(Debug, Clone, Default)]
pub struct BlobWriteOptions {
    pub headers: BlobHttpHeaders,
    pub metadata: Metadata,
    pub tags: Tags,
    pub tier: Option<AccessTier>,
    pub conditions: BlobRequestConditions,
}

impl BlobWriteOptions {
    /// Options that fail with `BlobAlreadyExists` if the blob exists.
    pub fn if_not_exists() -> Self {
        Self {
            conditions: BlobRequestConditions::if_not_exists(),
            ..Self::default()
        }
    }

    /// Apply headers, metadata, tags, tier and destination conditions.
    pub(crate) fn apply(&self, request: StorageRequest) -> StorageRequest {
        let mut request = self.headers.apply(request);
        for (name, value) in &self.metadata {
            request = request.header(format!("x-ms-meta-{name}"), value.clone());
        }
        if !self.tags.is_empty() {
            request = request.header("x-ms-tags", encode_tags(&self.tags));
        }
        request = request.header_opt("x-ms-access-tier", self.tier.as_ref().map(|t| t.to_string()));
        self.conditions.apply(request)
    }
}

impl Validate for BlobWriteOptions {
    fn validate(&self) -> StorageResult<()> {
        validate_metadata(&self.metadata)?;
        if self.tags.len() > 10 {
            return Err(StorageError::Builder(format!(
                "a blob can have at most 10 tags, got {}",
                self.tags.len()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Properties returned by operations that write block blob content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBlobItem {
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    /// Transactional MD5 of the request body, when the service computed one.
    pub content_md5: Option<Vec<u8>>,
    pub is_server_encrypted: Option<bool>,
    /// SHA-256 of the customer-provided key used to encrypt the content.
    pub encryption_key_sha256: Option<String>,
    pub encryption_scope: Option<String>,
    pub version_id: Option<String>,
}

impl BlockBlobItem {
    pub(crate) fn from_headers(map: &HeaderMap) -> Self {
        Self {
            etag: header_str(map, headers::ETAG).map(str::to_string),
            last_modified: header_http_date(map, headers::LAST_MODIFIED),
            content_md5: header_base64(map, headers::CONTENT_MD5),
            is_server_encrypted: header_bool(map, "x-ms-request-server-encrypted"),
            encryption_key_sha256: header_str(map, "x-ms-encryption-key-sha256")
                .map(str::to_string),
            encryption_scope: header_str(map, "x-ms-encryption-scope").map(str::to_string),
            version_id: header_str(map, "x-ms-version-id").map(str::to_string),
        }
    }
}

/// Which blocks Get Block List returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockListType {
    Committed,
    Uncommitted,
    #[default]
    All,
}

impl BlockListType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Committed => "committed",
            Self::Uncommitted => "uncommitted",
            Self::All => "all",
        }
    }
}

/// A single block in a block list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Block {
    /// Base64 block id.
    pub name: String,
    /// Block size in bytes.
    pub size: u64,
}

/// The committed and uncommitted blocks of a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockList {
    pub committed: Vec<Block>,
    pub uncommitted: Vec<Block>,
    /// ETag of the blob; absent when the blob has no committed blocks.
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    /// Size of the committed blob content.
    pub blob_content_length: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BlockListXml {
    #[serde(default)]
    committed_blocks: BlocksXml,
    #[serde(default)]
    uncommitted_blocks: BlocksXml,
}

#[derive(Debug, Default, Deserialize)]
struct BlocksXml {
    #[serde(rename = "Block", default)]
    blocks: Vec<Block>,
}

impl BlockList {
    pub(crate) fn from_response(map: &HeaderMap, body: &str) -> StorageResult<Self> {
        let body = body.trim_start_matches('\u{feff}');
        let xml: BlockListXml = quick_xml::de::from_str(body)?;
        Ok(Self {
            committed: xml.committed_blocks.blocks,
            uncommitted: xml.uncommitted_blocks.blocks,
            etag: header_str(map, headers::ETAG).map(str::to_string),
            last_modified: header_http_date(map, headers::LAST_MODIFIED),
            blob_content_length: header_str(map, "x-ms-blob-content-length")
                .and_then(|v| v.parse().ok()),
        })
    }
}

/// Build the Put Block List body committing `block_ids` in order.
pub(crate) fn block_list_body(block_ids: &[String]) -> String {
    let mut body = String::with_capacity(64 + block_ids.len() * 72);
    body.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
    for id in block_ids {
        body.push_str("<Latest>");
        body.push_str(&quick_xml::escape::escape(id.as_str()));
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

// ---------------------------------------------------------------------------
// Ranges, encryption, transfer settings
// ---------------------------------------------------------------------------

/// A byte range of a source blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlobRange {
    pub offset: u64,
    /// Number of bytes; `None` reads to the end of the blob.
    pub count: Option<u64>,
}

impl BlobRange {
    pub fn new(offset: u64, count: Option<u64>) -> Self {
        Self { offset, count }
    }

    /// `bytes=start-end`, or `None` for the whole blob.
    pub fn to_header_value(&self) -> Option<String> {
        match self.count {
            Some(count) => Some(format!(
                "bytes={}-{}",
                self.offset,
                self.offset.saturating_add(count.saturating_sub(1))
            )),
            None if self.offset == 0 => None,
            None => Some(format!("bytes={}-", self.offset)),
        }
    }
}

impl Validate for BlobRange {
    fn validate(&self) -> StorageResult<()> {
        match self.count {
            Some(0) => Err(StorageError::Builder("range count must be positive".into())),
            Some(count) if self.offset.checked_add(count).is_none() => Err(
                StorageError::Builder("range end overflows".into()),
            ),
            _ => Ok(()),
        }
    }
}

/// A customer-provided AES-256 key used to encrypt blob content at rest.
///
/// The key travels with every write; the service stores only its SHA-256.
#[derive(Clone)]
pub struct CustomerProvidedKey {
    key: SecretString,
    key_sha256: String,
}

impl CustomerProvidedKey {
    /// Encryption algorithm sent in `x-ms-encryption-algorithm`.
    pub const ALGORITHM: &'static str = "AES256";

    /// Create a key from raw key bytes.
    pub fn from_bytes(key: &[u8]) -> Self {
        Self {
            key: SecretString::from(BASE64_STANDARD.encode(key)),
            key_sha256: BASE64_STANDARD.encode(Sha256::digest(key)),
        }
    }

    /// Create a key from its base64 encoding.
    pub fn from_base64(key: &str) -> StorageResult<Self> {
        let bytes = BASE64_STANDARD
            .decode(key)
            .map_err(|e| StorageError::Builder(format!("encryption key is not valid base64: {e}")))?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Base64 SHA-256 of the key.
    pub fn key_sha256(&self) -> &str {
        &self.key_sha256
    }

    pub(crate) fn apply(&self, request: StorageRequest) -> StorageRequest {
        request
            .header("x-ms-encryption-key", self.key.expose_secret())
            .header("x-ms-encryption-key-sha256", self.key_sha256.as_str())
            .header("x-ms-encryption-algorithm", Self::ALGORITHM)
    }
}

impl fmt::Debug for CustomerProvidedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomerProvidedKey")
            .field("key", &"[REDACTED]")
            .field("key_sha256", &self.key_sha256)
            .finish()
    }
}

/// Settings for chunked uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelTransferOptions {
    /// Size of each staged block.
    pub block_size: usize,
    /// Uploads at or below this size use a single Put Blob.
    pub max_single_upload_size: usize,
    /// Maximum number of blocks staged at once.
    pub max_concurrency: usize,
}

impl Default for ParallelTransferOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_single_upload_size: DEFAULT_MAX_SINGLE_UPLOAD_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl Validate for ParallelTransferOptions {
    fn validate(&self) -> StorageResult<()> {
        if self.block_size == 0 || self.block_size as u64 > MAX_STAGE_BLOCK_BYTES {
            return Err(StorageError::Builder(format!(
                "block_size must be between 1 and {MAX_STAGE_BLOCK_BYTES}, got {}",
                self.block_size
            )));
        }
        if self.max_single_upload_size as u64 > MAX_UPLOAD_BLOB_BYTES {
            return Err(StorageError::Builder(format!(
                "max_single_upload_size must be at most {MAX_UPLOAD_BLOB_BYTES}, got {}",
                self.max_single_upload_size
            )));
        }
        if self.max_concurrency == 0 {
            return Err(StorageError::Builder(
                "max_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block ids
// ---------------------------------------------------------------------------

/// Generate a new block id.
///
/// Ids are the base64 encoding of a random v4 UUID, so every id of a blob
/// has the same length as the service requires.
pub fn generate_block_id() -> String {
    BASE64_STANDARD.encode(uuid::Uuid::new_v4().to_string())
}

/// Check that `block_id` is non-empty base64 of at most 64 decoded bytes.
pub fn validate_block_id(block_id: &str) -> StorageResult<()> {
    if block_id.is_empty() {
        return Err(StorageError::Builder("block id must not be empty".into()));
    }
    let decoded = BASE64_STANDARD
        .decode(block_id)
        .map_err(|_| StorageError::Builder(format!("block id '{block_id}' is not valid base64")))?;
    if decoded.len() > MAX_BLOCK_ID_BYTES {
        return Err(StorageError::Builder(format!(
            "block id decodes to {} bytes, at most {MAX_BLOCK_ID_BYTES} allowed",
            decoded.len()
        )));
    }
    Ok(())
}
