#![doc = include_str!("../README.md")]

pub mod auth;
pub mod client;
pub mod error;
pub mod models;
mod sign;

pub use error::StorageError;

/// Helpers for testing crates built on this one against a mock server.
#[cfg(feature = "test-support")]
pub mod test_support {
    use std::time::Duration;

    use wiremock::MockServer;

    use crate::auth::StorageCredential;
    use crate::client::{RetryPolicy, StorageClient};

    /// Test account name.
    pub const TEST_ACCOUNT: &str = "testaccount";

    /// Test account key (valid base64, not a real key).
    pub const TEST_ACCOUNT_KEY: &str = "dGVzdC1hY2NvdW50LWtleS1ub3QtcmVhbA==";

    /// Create a Shared Key client pointed at a mock server.
    ///
    /// Retries use a 1ms backoff so retry tests stay fast.
    ///
    /// # Panics
    ///
    /// Panics if the mock server URI is not a valid endpoint.
    pub fn mock_client(server: &MockServer) -> StorageClient {
        StorageClient::builder()
            .endpoint(server.uri())
            .credential(StorageCredential::shared_key(TEST_ACCOUNT, TEST_ACCOUNT_KEY))
            .retry_policy(RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
            })
            .build()
            .expect("should build mock client")
    }
}
