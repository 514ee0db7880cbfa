//! AWS KMS master key provider for fledoc.
//!
//! Data keys are wrapped with the KMS `Encrypt` call and unwrapped with
//! `Decrypt`; the master key never leaves KMS. Calls are bounded by a
//! deadline so an unreachable KMS surfaces as a retryable error instead of
//! a hang.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use fledoc_kms_aws::AwsKmsProvider;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AwsKmsProvider::new(
//!     "arn:aws:kms:us-east-1:123456789012:key/12345678-1234-1234-1234-123456789012",
//!     Duration::from_secs(5),
//! )?;
//! # Ok(())
//! # }
//! ```
//!
//! # AWS Configuration
//!
//! [`AwsKmsProvider::new`] uses the AWS SDK's default credential chain:
//! - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)
//! - AWS credentials file (~/.aws/credentials)
//! - IAM instance profile (for EC2)
//! - ECS task role
//! - Web identity token (for EKS)
//!
//! The provider drives the SDK on its own single-threaded runtime. Do not
//! call it from inside another async runtime's worker thread.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::future::Future;
use std::time::Duration;

use aws_sdk_kms::error::{DisplayErrorContext, SdkError};
use aws_sdk_kms::primitives::Blob;
use aws_sdk_kms::Client as KmsClient;
use fledoc::data_key::MasterKey;
use fledoc::error::KeyProviderError;
use fledoc::key_provider::KeyWrapProvider;
use secrecy::SecretVec;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

/// Provider name recorded in every data key this provider wraps.
pub const PROVIDER_NAME: &str = "aws";

const CONTEXT_KEY: &str = "fledoc";
const CONTEXT_VALUE: &str = "data-key";

/// Errors raised while setting up the provider.
#[derive(Debug, Error)]
pub enum AwsKmsError {
    /// No KMS key id, ARN or alias was given
    #[error("KMS key id must not be empty")]
    EmptyKeyId,

    /// The deadline must be positive
    #[error("KMS timeout must be positive")]
    ZeroTimeout,

    /// The internal runtime could not start
    #[error("failed to start KMS runtime: {0}")]
    Runtime(#[from] std::io::Error),
}

impl From<AwsKmsError> for KeyProviderError {
    fn from(err: AwsKmsError) -> Self {
        match err {
            AwsKmsError::Runtime(e) => Self::Io(e),
            other => Self::InvalidMasterKey(other.to_string()),
        }
    }
}

/// AWS KMS key provider implementation.
pub struct AwsKmsProvider {
    client: KmsClient,
    key_id: String,
    timeout: Duration,
    runtime: Runtime,
}

impl AwsKmsProvider {
    /// Creates a provider with the SDK's default configuration.
    ///
    /// # Arguments
    ///
    /// * `key_id` - KMS key id, ARN, or alias (e.g. "alias/fledoc-master")
    /// * `timeout` - Deadline for each KMS call
    ///
    /// # Errors
    ///
    /// Returns an error if the key id is empty, the timeout is zero, or the
    /// runtime cannot start.
    pub fn new(key_id: impl Into<String>, timeout: Duration) -> Result<Self, AwsKmsError> {
        let runtime = new_runtime()?;
        let config =
            runtime.block_on(aws_config::defaults(aws_config::BehaviorVersion::latest()).load());
        Self::build(KmsClient::new(&config), key_id.into(), timeout, runtime)
    }

    /// Creates a provider around an already configured client.
    ///
    /// # Errors
    ///
    /// Same as [`AwsKmsProvider::new`].
    pub fn with_client(
        client: KmsClient,
        key_id: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, AwsKmsError> {
        Self::build(client, key_id.into(), timeout, new_runtime()?)
    }

    fn build(
        client: KmsClient,
        key_id: String,
        timeout: Duration,
        runtime: Runtime,
    ) -> Result<Self, AwsKmsError> {
        if key_id.is_empty() {
            return Err(AwsKmsError::EmptyKeyId);
        }
        if timeout.is_zero() {
            return Err(AwsKmsError::ZeroTimeout);
        }
        Ok(Self {
            client,
            key_id,
            timeout,
            runtime,
        })
    }

    /// Returns the KMS key id.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Returns the per-call deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    fn call<F, T>(&self, operation: &str, future: F) -> Result<T, KeyProviderError>
    where
        F: Future<Output = Result<T, KeyProviderError>>,
    {
        self.runtime.block_on(async {
            tokio::time::timeout(self.timeout, future).await.unwrap_or_else(|_| {
                warn!(
                    operation,
                    key_id = %self.key_id,
                    timeout = ?self.timeout,
                    "KMS call timed out"
                );
                Err(KeyProviderError::Timeout(format!(
                    "KMS {operation} exceeded {:?}",
                    self.timeout
                )))
            })
        })
    }
}

fn new_runtime() -> Result<Runtime, AwsKmsError> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// Maps transport-level SDK failures; service errors become `Unavailable`
/// unless the caller recognised them first.
fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> KeyProviderError
where
    E: std::error::Error + Send + Sync + 'static,
    R: fmt::Debug,
{
    let detail = format!("KMS {operation} failed: {}", DisplayErrorContext(&err));
    match err {
        SdkError::TimeoutError(_) => KeyProviderError::Timeout(detail),
        _ => KeyProviderError::Unavailable(detail),
    }
}

impl fmt::Debug for AwsKmsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AwsKmsProvider")
            .field("key_id", &self.key_id)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl KeyWrapProvider for AwsKmsProvider {
    fn master_key(&self) -> MasterKey {
        MasterKey::new(PROVIDER_NAME, self.key_id.as_str())
    }

    fn wrap_key(&self, plaintext_key: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let request = self
            .client
            .encrypt()
            .key_id(&self.key_id)
            .encryption_context(CONTEXT_KEY, CONTEXT_VALUE)
            .plaintext(Blob::new(plaintext_key.to_vec()));

        let response = self.call("encrypt", async {
            request.send().await.map_err(|e| map_sdk_error("encrypt", e))
        })?;

        let wrapped = response
            .ciphertext_blob()
            .ok_or_else(|| KeyProviderError::WrapFailed("KMS returned no ciphertext".to_string()))?;
        debug!(key_id = %self.key_id, "wrapped data key with KMS");
        Ok(wrapped.as_ref().to_vec())
    }

    fn unwrap_key(&self, wrapped_key: &[u8]) -> Result<SecretVec<u8>, KeyProviderError> {
        let request = self
            .client
            .decrypt()
            .key_id(&self.key_id)
            .encryption_context(CONTEXT_KEY, CONTEXT_VALUE)
            .ciphertext_blob(Blob::new(wrapped_key.to_vec()));

        let response = self.call("decrypt", async {
            request.send().await.map_err(|e| {
                let rejected = e.as_service_error().is_some_and(|service| {
                    service.is_invalid_ciphertext_exception()
                        || service.is_incorrect_key_exception()
                });
                if rejected {
                    KeyProviderError::IntegrityFailed
                } else {
                    map_sdk_error("decrypt", e)
                }
            })
        })?;

        let plaintext = response
            .plaintext()
            .ok_or_else(|| KeyProviderError::Unavailable("KMS returned no plaintext".to_string()))?;
        debug!(key_id = %self.key_id, "unwrapped data key with KMS");
        Ok(SecretVec::new(plaintext.as_ref().to_vec()))
    }
}
