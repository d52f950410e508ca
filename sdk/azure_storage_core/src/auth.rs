//! Credentials for Azure Blob Storage.
//!
//! Storage accepts four kinds of authorization: Shared Key (the account key
//! signs every request), shared access signatures (a pre-signed query string),
//! Microsoft Entra ID bearer tokens, and anonymous access for public
//! containers. [`StorageCredential`] covers all four.

use std::sync::Arc;

use azure_core::credentials::TokenCredential;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{StorageError, StorageResult};
use crate::sign;

/// OAuth scope for Azure Storage data-plane access.
pub const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

/// Account name used by the local storage emulator (Azurite).
pub const DEV_STORE_ACCOUNT: &str = "devstoreaccount1";

/// Well-known account key of the local storage emulator (Azurite).
pub const DEV_STORE_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

/// Blob endpoint of the local storage emulator (Azurite).
pub const DEV_STORE_BLOB_ENDPOINT: &str = "http://127.0.0.1:10000/devstoreaccount1";

/// Credential types supported by the storage SDK.
#[derive(Clone)]
pub enum StorageCredential {
    /// Shared Key authentication with the base64-encoded account key.
    SharedKey {
        /// Storage account name.
        account: String,
        /// Base64-encoded account key.
        key: SecretString,
    },

    /// Shared access signature, appended to every request URL.
    SasToken(SecretString),

    /// Microsoft Entra ID token-based authentication.
    TokenCredential(Arc<dyn TokenCredential>),

    /// No authorization (public containers, emulator tests).
    Anonymous,
}

impl StorageCredential {
    /// Resolve a credential from the environment.
    ///
    /// Checked in order:
    /// 1. `AZURE_STORAGE_CONNECTION_STRING`
    /// 2. `AZURE_STORAGE_ACCOUNT` together with `AZURE_STORAGE_KEY`
    /// 3. `AZURE_STORAGE_SAS_TOKEN`
    /// 4. The Azure CLI login
    pub fn from_env() -> StorageResult<Self> {
        if let Some(conn) = non_empty_env("AZURE_STORAGE_CONNECTION_STRING") {
            return ConnectionString::parse(&conn)?.credential();
        }

        if let (Some(account), Some(key)) = (
            non_empty_env("AZURE_STORAGE_ACCOUNT"),
            non_empty_env("AZURE_STORAGE_KEY"),
        ) {
            return Ok(Self::shared_key(account, key));
        }

        if let Some(sas) = non_empty_env("AZURE_STORAGE_SAS_TOKEN") {
            return Ok(Self::sas_token(sas));
        }

        Self::azure_cli()
    }

    /// Create a Shared Key credential.
    pub fn shared_key(account: impl Into<String>, key: impl Into<String>) -> Self {
        Self::SharedKey {
            account: account.into(),
            key: SecretString::from(key.into()),
        }
    }

    /// Create a SAS credential. A leading `?` is ignored.
    pub fn sas_token(token: impl Into<String>) -> Self {
        let token = token.into();
        let token = token.strip_prefix('?').map(str::to_string).unwrap_or(token);
        Self::SasToken(SecretString::from(token))
    }

    /// Wrap any `azure_core` token credential.
    pub fn token_credential(credential: Arc<dyn TokenCredential>) -> Self {
        Self::TokenCredential(credential)
    }

    /// Use the identity currently logged in to the Azure CLI.
    pub fn azure_cli() -> StorageResult<Self> {
        let credential = azure_identity::AzureCliCredential::new(None)
            .map_err(|e| StorageError::Auth(format!("failed to create Azure CLI credential: {e}")))?;
        Ok(Self::TokenCredential(credential))
    }

    /// No authorization.
    pub fn anonymous() -> Self {
        Self::Anonymous
    }

    /// The account name, when the credential carries one.
    pub fn account_name(&self) -> Option<&str> {
        match self {
            Self::SharedKey { account, .. } => Some(account),
            _ => None,
        }
    }

    /// Authorize a fully-built request in place.
    ///
    /// Shared Key signing covers every header, so this must run after all
    /// headers (including `x-ms-date`) have been set.
    pub async fn authorize(&self, request: &mut reqwest::Request) -> StorageResult<()> {
        match self {
            Self::SharedKey { account, key } => {
                let value = sign::shared_key_authorization(account, key.expose_secret(), request)?;
                insert_authorization(request, &value)
            }
            Self::SasToken(token) => {
                let token = token.expose_secret();
                let url = request.url_mut();
                let query = match url.query() {
                    Some(q) if !q.is_empty() => format!("{q}&{token}"),
                    _ => token.to_string(),
                };
                url.set_query(Some(&query));
                Ok(())
            }
            Self::TokenCredential(credential) => {
                let token = credential
                    .get_token(&[STORAGE_SCOPE], None)
                    .await
                    .map_err(|e| StorageError::Auth(format!("failed to acquire token: {e}")))?;
                let value = format!("Bearer {}", token.token.secret());
                insert_authorization(request, &value)
            }
            Self::Anonymous => Ok(()),
        }
    }
}

fn insert_authorization(request: &mut reqwest::Request, value: &str) -> StorageResult<()> {
    let mut header = reqwest::header::HeaderValue::from_str(value)
        .map_err(|e| StorageError::Auth(format!("invalid Authorization header: {e}")))?;
    header.set_sensitive(true);
    request
        .headers_mut()
        .insert(reqwest::header::AUTHORIZATION, header);
    Ok(())
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl std::fmt::Debug for StorageCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SharedKey { account, .. } => {
                write!(f, "StorageCredential::SharedKey({account}, ****)")
            }
            Self::SasToken(_) => write!(f, "StorageCredential::SasToken(****)"),
            Self::TokenCredential(_) => write!(f, "StorageCredential::TokenCredential"),
            Self::Anonymous => write!(f, "StorageCredential::Anonymous"),
        }
    }
}

/// A parsed storage account connection string.
///
/// ```rust
/// use azure_storage_core::auth::ConnectionString;
///
/// let conn = ConnectionString::parse(
///     "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=a2V5;EndpointSuffix=core.windows.net",
/// ).expect("valid connection string");
/// assert_eq!(conn.blob_endpoint().unwrap(), "https://acct.blob.core.windows.net");
/// ```
#[derive(Clone, Default)]
pub struct ConnectionString {
    account_name: Option<String>,
    account_key: Option<SecretString>,
    shared_access_signature: Option<SecretString>,
    blob_endpoint: Option<String>,
    protocol: Option<String>,
    endpoint_suffix: Option<String>,
}

impl ConnectionString {
    /// Parse `key=value` pairs separated by `;`.
    pub fn parse(s: &str) -> StorageResult<Self> {
        let mut conn = Self::default();

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                StorageError::MissingConfig(format!(
                    "malformed connection string segment (expected key=value): {}",
                    key_only(part)
                ))
            })?;

            match key {
                "UseDevelopmentStorage" if value.eq_ignore_ascii_case("true") => {
                    conn.account_name = Some(DEV_STORE_ACCOUNT.to_string());
                    conn.account_key = Some(SecretString::from(DEV_STORE_KEY.to_string()));
                    conn.blob_endpoint = Some(DEV_STORE_BLOB_ENDPOINT.to_string());
                }
                "AccountName" => conn.account_name = Some(value.to_string()),
                "AccountKey" => conn.account_key = Some(SecretString::from(value.to_string())),
                "SharedAccessSignature" => {
                    conn.shared_access_signature = Some(SecretString::from(value.to_string()))
                }
                "BlobEndpoint" => conn.blob_endpoint = Some(value.trim_end_matches('/').to_string()),
                "DefaultEndpointsProtocol" => conn.protocol = Some(value.to_string()),
                "EndpointSuffix" => conn.endpoint_suffix = Some(value.to_string()),
                _ => tracing::trace!(key, "ignoring connection string key"),
            }
        }

        if conn.account_name.is_none() && conn.blob_endpoint.is_none() {
            return Err(StorageError::MissingConfig(
                "connection string must contain AccountName or BlobEndpoint".into(),
            ));
        }

        Ok(conn)
    }

    /// The account name, if present.
    pub fn account_name(&self) -> Option<&str> {
        self.account_name.as_deref()
    }

    /// The credential described by the connection string.
    ///
    /// An account key takes precedence over a shared access signature.
    pub fn credential(&self) -> StorageResult<StorageCredential> {
        match (&self.account_name, &self.account_key, &self.shared_access_signature) {
            (Some(account), Some(key), _) => Ok(StorageCredential::SharedKey {
                account: account.clone(),
                key: key.clone(),
            }),
            (_, _, Some(sas)) => Ok(StorageCredential::sas_token(sas.expose_secret())),
            (None, Some(_), None) => Err(StorageError::MissingConfig(
                "connection string has AccountKey but no AccountName".into(),
            )),
            _ => Err(StorageError::MissingConfig(
                "connection string has neither AccountKey nor SharedAccessSignature".into(),
            )),
        }
    }

    /// The blob service endpoint.
    ///
    /// Uses `BlobEndpoint` when present, otherwise
    /// `{protocol}://{account}.blob.{suffix}`.
    pub fn blob_endpoint(&self) -> StorageResult<String> {
        if let Some(endpoint) = &self.blob_endpoint {
            return Ok(endpoint.clone());
        }
        let account = self.account_name.as_deref().ok_or_else(|| {
            StorageError::MissingConfig("connection string has no AccountName".into())
        })?;
        let protocol = self.protocol.as_deref().unwrap_or("https");
        let suffix = self.endpoint_suffix.as_deref().unwrap_or("core.windows.net");
        Ok(format!("{protocol}://{account}.blob.{suffix}"))
    }
}

fn key_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or("")
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionString")
            .field("account_name", &self.account_name)
            .field("account_key", &self.account_key.as_ref().map(|_| "****"))
            .field(
                "shared_access_signature",
                &self.shared_access_signature.as_ref().map(|_| "****"),
            )
            .field("blob_endpoint", &self.blob_endpoint)
            .field("protocol", &self.protocol)
            .field("endpoint_suffix", &self.endpoint_suffix)
            .finish()
    }
}
