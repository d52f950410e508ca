use thiserror::Error;

/// Errors that can occur when interacting with the Azure Blob Storage API.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The request failed with an HTTP error and no service error body.
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    /// The service returned a structured error response.
    #[error("API error ({code}, HTTP {status}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// Authentication or request signing failed.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A JSON payload could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An XML payload could not be decoded.
    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::DeError),

    /// The HTTP request failed at the transport level.
    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint URL is invalid.
    #[error("Invalid endpoint URL: {message}")]
    InvalidEndpoint {
        message: String,
        #[source]
        source: Option<url::ParseError>,
    },

    /// A required configuration value is missing.
    #[error("Missing configuration: {0}")]
    MissingConfig(String),

    /// A request or options value failed validation.
    #[error("Invalid request: {0}")]
    Builder(String),

    /// The writer or channel is not in a state that allows the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation cannot be expressed against a block blob.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl StorageError {
    /// Create an [`StorageError::Http`] error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Create an [`StorageError::InvalidEndpoint`] error without an underlying cause.
    pub fn invalid_endpoint(message: impl Into<String>) -> Self {
        Self::InvalidEndpoint {
            message: message.into(),
            source: None,
        }
    }

    /// Create an [`StorageError::InvalidEndpoint`] error wrapping a URL parse failure.
    pub fn invalid_endpoint_with_source(message: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidEndpoint {
            message: format!("{}: {source}", message.into()),
            source: Some(source),
        }
    }

    /// The HTTP status of the failed response, if the error came from one.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } | Self::Api { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// The service error code (`x-ms-error-code`), if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Returns `true` if the target resource does not exist.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Returns `true` if a conditional header (`If-Match`, `If-None-Match`, ...) was not met.
    pub fn is_condition_not_met(&self) -> bool {
        self.status() == Some(412) || self.error_code() == Some("ConditionNotMet")
    }

    /// Returns `true` if the blob already exists and the request did not allow overwriting it.
    pub fn is_blob_already_exists(&self) -> bool {
        self.error_code() == Some("BlobAlreadyExists")
            || (self.status() == Some(409) && self.error_code().is_none())
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
