//! Shared Key request signing.
//!
//! Implements the Azure Storage Shared Key authorization scheme for the Blob
//! service (version 2009-09-19 and later):
//!
//! ```text
//! VERB\n
//! Content-Encoding\n
//! Content-Language\n
//! Content-Length\n
//! Content-MD5\n
//! Content-Type\n
//! Date\n
//! If-Modified-Since\n
//! If-Match\n
//! If-None-Match\n
//! If-Unmodified-Since\n
//! Range\n
//! CanonicalizedHeaders
//! CanonicalizedResource
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{
    HeaderMap, CONTENT_ENCODING, CONTENT_LANGUAGE, CONTENT_LENGTH, CONTENT_TYPE, DATE,
    IF_MATCH, IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE, RANGE,
};
use sha2::Sha256;

use crate::error::{StorageError, StorageResult};

type HmacSha256 = Hmac<Sha256>;

/// Build the `Authorization` header value for a request.
///
/// `key` is the base64-encoded storage account key.
pub(crate) fn shared_key_authorization(
    account: &str,
    key: &str,
    request: &reqwest::Request,
) -> StorageResult<String> {
    let key_bytes = BASE64_STANDARD
        .decode(key)
        .map_err(|e| StorageError::Auth(format!("account key is not valid base64: {e}")))?;

    let string_to_sign = string_to_sign(account, request);

    let mut mac = HmacSha256::new_from_slice(&key_bytes)
        .map_err(|e| StorageError::Auth(format!("HMAC key error: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());

    Ok(format!("SharedKey {account}:{signature}"))
}

/// Build the canonical string-to-sign for a request.
pub(crate) fn string_to_sign(account: &str, request: &reqwest::Request) -> String {
    let headers = request.headers();

    let content_length = match header(headers, CONTENT_LENGTH.as_str()) {
        "" => request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| b.len())
            .unwrap_or(0),
        declared => declared.parse().unwrap_or(0),
    };
    // Since 2015-02-21 a zero length must be signed as the empty string.
    let content_length = if content_length == 0 {
        String::new()
    } else {
        content_length.to_string()
    };

    let mut out = String::with_capacity(256);
    out.push_str(request.method().as_str());
    out.push('\n');
    for value in [
        header(headers, CONTENT_ENCODING.as_str()),
        header(headers, CONTENT_LANGUAGE.as_str()),
        content_length.as_str(),
        header(headers, "content-md5"),
        header(headers, CONTENT_TYPE.as_str()),
        header(headers, DATE.as_str()),
        header(headers, IF_MODIFIED_SINCE.as_str()),
        header(headers, IF_MATCH.as_str()),
        header(headers, IF_NONE_MATCH.as_str()),
        header(headers, IF_UNMODIFIED_SINCE.as_str()),
        header(headers, RANGE.as_str()),
    ] {
        out.push_str(value);
        out.push('\n');
    }

    out.push_str(&canonicalized_headers(headers));
    out.push_str(&canonicalized_resource(account, request.url()));
    out
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// `x-ms-*` headers, lowercased and sorted, one `name:value\n` line each.
fn canonicalized_headers(headers: &HeaderMap) -> String {
    let mut ms_headers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if !name.starts_with("x-ms-") {
            continue;
        }
        if let Ok(value) = value.to_str() {
            ms_headers.entry(name).or_default().push(value.trim());
        }
    }

    let mut out = String::new();
    for (name, values) in ms_headers {
        out.push_str(name);
        out.push(':');
        out.push_str(&values.join(","));
        out.push('\n');
    }
    out
}

/// `/{account}{path}` followed by `\nname:value` for every query parameter.
fn canonicalized_resource(account: &str, url: &url::Url) -> String {
    let mut out = format!("/{account}{}", url.path());

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in url.query_pairs() {
        params
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into_owned());
    }

    for (name, mut values) in params {
        values.sort();
        out.push('\n');
        out.push_str(&name);
        out.push(':');
        out.push_str(&values.join(","));
    }
    out
}
