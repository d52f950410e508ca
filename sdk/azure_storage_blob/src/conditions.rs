//! Conditional request headers for blob operations.

use std::time::SystemTime;

use azure_storage_core::client::StorageRequest;
use azure_storage_core::models::{format_http_date, headers, ETAG_WILDCARD};

/// Conditions a blob must satisfy for a request to succeed.
///
/// When applied to the destination of a write, the conditions become the
/// standard `If-*` headers plus `x-ms-lease-id` and `x-ms-if-tags`. When used
/// as the source of a copy-from-URL operation they are sent with the
/// `x-ms-source-` prefix; the lease id has no source form and is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobRequestConditions {
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    /// Active lease on the blob.
    pub lease_id: Option<String>,
    /// SQL-like predicate over the blob's index tags.
    pub tags_conditions: Option<String>,
}

impl BlobRequestConditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `If-None-Match: *`, so a write fails if the blob already exists.
    pub fn if_not_exists() -> Self {
        Self {
            if_none_match: Some(ETAG_WILDCARD.to_string()),
            ..Self::default()
        }
    }

    /// Require the blob's current ETag.
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    pub fn with_if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn with_if_modified_since(mut self, time: SystemTime) -> Self {
        self.if_modified_since = Some(time);
        self
    }

    pub fn with_if_unmodified_since(mut self, time: SystemTime) -> Self {
        self.if_unmodified_since = Some(time);
        self
    }

    pub fn with_lease_id(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    pub fn with_tags_conditions(mut self, predicate: impl Into<String>) -> Self {
        self.tags_conditions = Some(predicate.into());
        self
    }

    /// Returns `true` if no condition is set.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Returns `true` if the conditions only allow creating a new blob.
    pub fn is_if_not_exists(&self) -> bool {
        self.if_none_match.as_deref() == Some(ETAG_WILDCARD)
    }

    /// Apply as destination conditions.
    pub(crate) fn apply(&self, request: StorageRequest) -> StorageRequest {
        request
            .header_opt("If-Match", self.if_match.clone())
            .header_opt("If-None-Match", self.if_none_match.clone())
            .header_opt(
                "If-Modified-Since",
                self.if_modified_since.map(format_http_date),
            )
            .header_opt(
                "If-Unmodified-Since",
                self.if_unmodified_since.map(format_http_date),
            )
            .header_opt(headers::LEASE_ID, self.lease_id.clone())
            .header_opt("x-ms-if-tags", self.tags_conditions.clone())
    }

    /// Apply as source conditions of a copy-from-URL operation.
    pub(crate) fn apply_as_source(&self, request: StorageRequest) -> StorageRequest {
        request
            .header_opt("x-ms-source-if-match", self.if_match.clone())
            .header_opt("x-ms-source-if-none-match", self.if_none_match.clone())
            .header_opt(
                "x-ms-source-if-modified-since",
                self.if_modified_since.map(format_http_date),
            )
            .header_opt(
                "x-ms-source-if-unmodified-since",
                self.if_unmodified_since.map(format_http_date),
            )
            .header_opt("x-ms-source-if-tags", self.tags_conditions.clone())
    }
}
