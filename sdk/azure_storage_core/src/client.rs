//! HTTP client for Azure Blob Storage.
//!
//! This module provides [`StorageClient`], the transport shared by every
//! storage operation. The client handles endpoint management, the
//! `x-ms-version`/`x-ms-date` protocol headers, authorization, retries, and
//! conversion of service error responses into [`StorageError`].
//!
//! # Examples
//!
//! ## Using a Shared Key
//! ```rust,no_run
//! use azure_storage_core::client::StorageClient;
//! use azure_storage_core::auth::StorageCredential;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StorageClient::builder()
//!     .endpoint("https://myaccount.blob.core.windows.net")
//!     .credential(StorageCredential::shared_key("myaccount", "base64-account-key"))
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Using a Connection String
//! ```rust,no_run
//! use azure_storage_core::client::StorageClient;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StorageClient::builder()
//!     .connection_string("UseDevelopmentStorage=true")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client as HttpClient, Method};
use serde::Deserialize;
use url::Url;

use crate::auth::{ConnectionString, StorageCredential};
use crate::error::{StorageError, StorageResult};
use crate::models::{format_http_date, header_str, headers};

/// Default Blob service REST API version.
pub const DEFAULT_API_VERSION: &str = "2023-11-03";

/// Default connection timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default read/response timeout (60 seconds).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Determines if an HTTP status code represents a retriable error.
///
/// Retriable errors are transient server-side issues that may succeed on retry:
/// - 408 Request Timeout
/// - 429 Too Many Requests (throttling)
/// - 500 Internal Server Error
/// - 502 Bad Gateway
/// - 503 Service Unavailable (server busy)
/// - 504 Gateway Timeout
#[inline]
pub fn is_retriable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Configuration for automatic retry behavior on transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial request).
    pub max_retries: u32,
    /// Initial backoff duration before the first retry.
    /// Subsequent retries use exponential backoff (2^attempt * initial_backoff).
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-based), with ±25% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let base_backoff = self.initial_backoff * 2_u32.saturating_pow(attempt);
        let jitter = 0.75 + fastrand::f64() * 0.5; // 0.75 to 1.25
        base_backoff.mul_f64(jitter)
    }
}

/// A single REST call against the storage endpoint.
///
/// The path is relative to the client endpoint and must already be
/// percent-encoded; query values are encoded when the URL is built.
#[derive(Debug, Clone)]
pub struct StorageRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl StorageRequest {
    /// Create a request with an arbitrary method.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Create a `GET` request.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// Create a `PUT` request.
    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    /// Create a `HEAD` request.
    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    /// Append a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a header when `value` is `Some`.
    pub fn header_opt<V: Into<String>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.header(name, v),
            None => self,
        }
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Limit each attempt to `timeout`, overriding the client's read timeout.
    /// `None` keeps the client default.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The endpoint-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The query parameters, in insertion order.
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// The first value of a header (name compared case-insensitively).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The request body, if any.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// The per-attempt timeout, if one was set.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// A decoded service response together with its status and headers.
#[derive(Debug, Clone)]
pub struct StorageResponse<T> {
    status: u16,
    headers: HeaderMap,
    value: T,
}

impl<T> StorageResponse<T> {
    /// Capture the status and headers of `response` alongside `value`.
    pub fn new(response: &reqwest::Response, value: T) -> Self {
        Self {
            status: response.status().as_u16(),
            headers: response.headers().clone(),
            value,
        }
    }

    /// The HTTP status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The service-assigned `x-ms-request-id`.
    pub fn request_id(&self) -> Option<&str> {
        header_str(&self.headers, headers::REQUEST_ID)
    }

    /// The `x-ms-client-request-id` echoed by the service.
    pub fn client_request_id(&self) -> Option<&str> {
        header_str(&self.headers, headers::CLIENT_REQUEST_ID)
    }

    /// All response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Replace the value, keeping status and headers.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StorageResponse<U> {
        StorageResponse {
            status: self.status,
            headers: self.headers,
            value: f(self.value),
        }
    }
}

/// The base client for interacting with the Azure Blob Storage API.
///
/// This client handles authentication, HTTP transport, and endpoint management.
/// It is used by higher-level crates (`azure_storage_blob`) to make API calls.
///
/// The client is cheaply cloneable and can be shared across threads.
#[derive(Debug, Clone)]
pub struct StorageClient {
    pub(crate) http: HttpClient,
    pub(crate) endpoint: Url,
    pub(crate) credential: StorageCredential,
    pub(crate) api_version: String,
    pub(crate) retry_policy: RetryPolicy,
}

/// Builder for constructing a [`StorageClient`].
///
/// Use [`StorageClient::builder()`] to create a new builder.
#[derive(Debug, Default)]
pub struct StorageClientBuilder {
    endpoint: Option<String>,
    credential: Option<StorageCredential>,
    connection_string: Option<String>,
    api_version: Option<String>,
    http_client: Option<HttpClient>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
}

impl StorageClient {
    /// Create a new builder for configuring a `StorageClient`.
    pub fn builder() -> StorageClientBuilder {
        StorageClientBuilder::default()
    }

    /// Get the blob service endpoint URL.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Get the REST API version sent as `x-ms-version`.
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Get the retry policy configuration.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Get the credential used to authorize requests.
    pub fn credential(&self) -> &StorageCredential {
        &self.credential
    }

    /// Build a full URL for an endpoint-relative path.
    ///
    /// A leading `/` is ignored so that endpoints with a path component
    /// (such as the emulator's `/devstoreaccount1`) are preserved.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be joined to the endpoint URL.
    pub fn url(&self, path: &str) -> StorageResult<Url> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|e| StorageError::invalid_endpoint_with_source("failed to construct URL", e))
    }

    /// Send a request with automatic retry on transient errors.
    ///
    /// Stamps `x-ms-version`, `x-ms-date` and `x-ms-client-request-id`,
    /// authorizes the request, and retries on retriable HTTP errors
    /// (408, 429, 500, 502, 503, 504) with exponential backoff. Each attempt
    /// is re-dated and re-signed.
    ///
    /// # Errors
    ///
    /// Returns an error if authorization fails, the request fails after all
    /// retries, or the server returns a non-retriable error response.
    pub async fn send(&self, request: StorageRequest) -> StorageResult<reqwest::Response> {
        let mut url = self.url(&request.path)?;
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }

        for attempt in 0..=self.retry_policy.max_retries {
            let mut http_request = self.build_request(&request, url.clone())?;
            self.credential.authorize(&mut http_request).await?;

            let response = self.http.execute(http_request).await?;
            let status = response.status().as_u16();

            // Success - return response
            if response.status().is_success() {
                return Ok(response);
            }

            // Non-retriable error or last attempt - return error
            if !is_retriable_status(status) || attempt == self.retry_policy.max_retries {
                return Self::check_response(response).await;
            }

            let backoff = self.retry_policy.backoff(attempt);
            tracing::debug!(
                status,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "retrying storage request",
            );
            tokio::time::sleep(backoff).await;
        }

        // This should never be reached due to the loop logic
        unreachable!("retry loop should return before reaching here")
    }

    fn build_request(&self, request: &StorageRequest, url: Url) -> StorageResult<reqwest::Request> {
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .header(headers::VERSION, &self.api_version)
            .header(headers::DATE, format_http_date(SystemTime::now()))
            .header(headers::CLIENT_REQUEST_ID, uuid::Uuid::new_v4().to_string());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        Ok(builder.build()?)
    }

    /// Maximum length for error messages to prevent sensitive data leaks.
    const MAX_ERROR_MESSAGE_LEN: usize = 1000;

    /// Markers whose following value is a secret.
    const SECRET_MARKERS: [&'static str; 3] = ["Bearer ", "SharedKey ", "sig="];

    /// Sanitize error messages by removing credentials.
    ///
    /// Redacts bearer tokens, Shared Key signatures and SAS `sig=` values so
    /// they cannot leak into logs through error messages.
    pub(crate) fn sanitize_error_message(msg: &str) -> String {
        let mut result = msg.to_string();

        for marker in Self::SECRET_MARKERS {
            // Use offset to avoid infinite loops
            let mut search_start = 0;
            while search_start < result.len() {
                let Some(relative_pos) = result[search_start..].find(marker) else {
                    break;
                };
                let value_start = search_start + relative_pos + marker.len();

                // Skip if already redacted
                if result[value_start..].starts_with("[REDACTED]") {
                    search_start = value_start + 10;
                    continue;
                }

                let value_end = result[value_start..]
                    .find(|c: char| {
                        c.is_whitespace() || matches!(c, '"' | '\'' | ',' | '&' | '<')
                    })
                    .map(|pos| value_start + pos)
                    .unwrap_or(result.len());

                if value_end > value_start {
                    result.replace_range(value_start..value_end, "[REDACTED]");
                    search_start = value_start + 10; // "[REDACTED]" is 10 chars
                } else {
                    search_start = value_start;
                }
            }
        }

        result
    }

    /// Truncate a message if it exceeds the maximum length.
    /// Also sanitizes sensitive data before truncating.
    pub(crate) fn truncate_message(msg: &str) -> String {
        // Sanitize first to ensure sensitive data is removed before truncation
        let sanitized = Self::sanitize_error_message(msg.trim());

        if sanitized.len() > Self::MAX_ERROR_MESSAGE_LEN {
            let mut cut = Self::MAX_ERROR_MESSAGE_LEN;
            while !sanitized.is_char_boundary(cut) {
                cut -= 1;
            }
            format!("{}... (truncated)", &sanitized[..cut])
        } else {
            sanitized
        }
    }

    /// Check the response status and return an error if not successful.
    ///
    /// The error code comes from the `x-ms-error-code` header when present,
    /// otherwise from an XML (`<Error><Code>`) or JSON (`{"error":{"code"}}`)
    /// body.
    async fn check_response(response: reqwest::Response) -> StorageResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let header_code = header_str(response.headers(), headers::ERROR_CODE).map(str::to_string);
        let body = response.text().await.unwrap_or_default();
        let parsed = parse_error_body(&body);

        let code = header_code.or_else(|| parsed.as_ref().and_then(|p| p.code.clone()));
        let message = parsed
            .and_then(|p| p.message)
            .unwrap_or_else(|| body.clone());

        match code {
            Some(code) => Err(StorageError::Api {
                status,
                code,
                message: Self::truncate_message(&message),
            }),
            None => Err(StorageError::http(status, Self::truncate_message(&body))),
        }
    }
}

/// `<Error><Code>..</Code><Message>..</Message></Error>`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct XmlErrorBody {
    code: Option<String>,
    message: Option<String>,
}

/// `{"error": {"code": "..", "message": ".."}}`
#[derive(Debug, Deserialize)]
struct JsonErrorEnvelope {
    error: JsonErrorBody,
}

#[derive(Debug, Deserialize)]
struct JsonErrorBody {
    code: Option<String>,
    message: Option<String>,
}

struct ParsedError {
    code: Option<String>,
    message: Option<String>,
}

fn parse_error_body(body: &str) -> Option<ParsedError> {
    let trimmed = body.trim_start_matches('\u{feff}').trim();
    if trimmed.starts_with('<') {
        let xml: XmlErrorBody = quick_xml::de::from_str(trimmed).ok()?;
        if xml.code.is_none() && xml.message.is_none() {
            return None;
        }
        return Some(ParsedError {
            code: xml.code,
            message: xml.message,
        });
    }
    if trimmed.starts_with('{') {
        let json: JsonErrorEnvelope = serde_json::from_str(trimmed).ok()?;
        return Some(ParsedError {
            code: json.error.code,
            message: json.error.message,
        });
    }
    None
}

impl StorageClientBuilder {
    /// Set the blob service endpoint URL.
    ///
    /// This should be in the format:
    /// `https://<account>.blob.core.windows.net`
    ///
    /// If not set, the builder uses the connection string's endpoint, then the
    /// `AZURE_STORAGE_BLOB_ENDPOINT` environment variable, then the default
    /// public endpoint for a Shared Key credential's account.
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the credential to use for authorization.
    ///
    /// If not set, the builder uses the connection string's credential, or
    /// [`StorageCredential::from_env()`].
    pub fn credential(mut self, credential: StorageCredential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Configure endpoint and credential from a storage connection string.
    ///
    /// Explicit [`endpoint`](Self::endpoint) and [`credential`](Self::credential)
    /// settings take precedence.
    pub fn connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    /// Set the REST API version.
    ///
    /// Defaults to [`DEFAULT_API_VERSION`] (`2023-11-03`).
    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Set a custom HTTP client.
    ///
    /// **Note:** If you provide a custom HTTP client, any timeout configuration
    /// via [`connect_timeout`](Self::connect_timeout) or
    /// [`read_timeout`](Self::read_timeout) will be ignored.
    pub fn http_client(mut self, client: HttpClient) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Set the connection timeout.
    ///
    /// **Note:** This setting is ignored if a custom HTTP client is provided
    /// via [`http_client`](Self::http_client).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the read timeout.
    ///
    /// This covers the entire request/response cycle including the body, so
    /// it bounds the time a single block upload may take.
    ///
    /// **Note:** This setting is ignored if a custom HTTP client is provided
    /// via [`http_client`](Self::http_client).
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the retry policy for transient errors.
    ///
    /// Defaults to 3 retries with 500ms initial backoff.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Build the `StorageClient`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The connection string is malformed
    /// - No endpoint can be determined
    /// - The endpoint URL is invalid or not http(s)
    /// - Credential creation fails (when using environment-based credentials)
    pub fn build(self) -> StorageResult<StorageClient> {
        let http = match self.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT))
                .timeout(self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT))
                .build()?,
        };

        let connection = self
            .connection_string
            .as_deref()
            .map(ConnectionString::parse)
            .transpose()?;

        let credential = match (self.credential, &connection) {
            (Some(credential), _) => credential,
            (None, Some(conn)) => conn.credential()?,
            (None, None) => StorageCredential::from_env()?,
        };

        let endpoint_str = match (self.endpoint, &connection) {
            (Some(endpoint), _) => endpoint,
            (None, Some(conn)) => conn.blob_endpoint()?,
            (None, None) => std::env::var("AZURE_STORAGE_BLOB_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty())
                .or_else(|| {
                    credential
                        .account_name()
                        .map(|account| format!("https://{account}.blob.core.windows.net"))
                })
                .ok_or_else(|| {
                    StorageError::MissingConfig(
                        "endpoint is required. Set it via builder, connection string, \
                         or AZURE_STORAGE_BLOB_ENDPOINT env var."
                            .into(),
                    )
                })?,
        };

        let mut endpoint = Url::parse(&endpoint_str)
            .map_err(|e| StorageError::invalid_endpoint_with_source("invalid endpoint URL", e))?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(StorageError::invalid_endpoint(format!(
                "unsupported scheme '{}', expected http or https",
                endpoint.scheme()
            )));
        }
        // Relative joins replace the last segment unless the path ends in '/'.
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(StorageClient {
            http,
            endpoint,
            credential,
            api_version: self
                .api_version
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
            retry_policy: self.retry_policy.unwrap_or_default(),
        })
    }
}
