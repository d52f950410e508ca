//! Common types shared across all Azure Storage crates.

use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::header::HeaderMap;

use crate::error::StorageResult;

/// ETag value matching any entity; `If-None-Match: *` means "only if absent".
pub const ETAG_WILDCARD: &str = "*";

/// Header names used across the Blob service REST API.
pub mod headers {
    pub const VERSION: &str = "x-ms-version";
    pub const DATE: &str = "x-ms-date";
    pub const CLIENT_REQUEST_ID: &str = "x-ms-client-request-id";
    pub const REQUEST_ID: &str = "x-ms-request-id";
    pub const ERROR_CODE: &str = "x-ms-error-code";
    pub const LEASE_ID: &str = "x-ms-lease-id";
    pub const CONTENT_MD5: &str = "content-md5";
    pub const ETAG: &str = "etag";
    pub const LAST_MODIFIED: &str = "last-modified";
}

/// Client-side validation of a request value before it is sent.
///
/// Every options type that carries required fields or service limits
/// implements this; the SDK calls it before issuing the request.
pub trait Validate {
    /// Returns an error describing the first invalid field.
    fn validate(&self) -> StorageResult<()>;
}

/// Format a timestamp as an RFC 1123 HTTP date.
pub fn format_http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

/// A header value as a string, if present and valid UTF-8.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A header value parsed as an HTTP date.
pub fn header_http_date(headers: &HeaderMap, name: &str) -> Option<SystemTime> {
    header_str(headers, name).and_then(|v| httpdate::parse_http_date(v).ok())
}

/// A header value decoded from base64.
pub fn header_base64(headers: &HeaderMap, name: &str) -> Option<Vec<u8>> {
    header_str(headers, name).and_then(|v| BASE64_STANDARD.decode(v).ok())
}

/// A header value parsed as a boolean (`true`/`false`, case-insensitive).
pub fn header_bool(headers: &HeaderMap, name: &str) -> Option<bool> {
    header_str(headers, name).and_then(|v| match v.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    })
}
