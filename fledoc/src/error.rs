//! Error types for `fledoc` operations.

use std::fmt;

use crate::data_key::KeyId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for `fledoc` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The operating system random source could not supply bytes.
    #[error("entropy source unavailable: {0}")]
    Entropy(String),

    /// The key wrapping provider could not be reached (retryable).
    #[error("key provider unavailable: {0}")]
    KeyProviderUnavailable(String),

    /// A network-bound operation exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Authentication tag verification failed (data or key tampered or mismatched)
    #[error("integrity check failed: ciphertext or wrapped key did not authenticate")]
    Integrity,

    /// No data key matches the given id or alternate name.
    #[error("data key not found: {0}")]
    KeyNotFound(String),

    /// A field path collides with one already registered for the collection.
    #[error("schema conflict in collection '{collection}': {detail}")]
    SchemaConflict {
        /// Collection being registered
        collection: String,
        /// Which paths collided
        detail: String,
    },

    /// A key alternate name is already used by another data key.
    #[error("duplicate key alt name: {0}")]
    DuplicateAltName(String),

    /// The envelope names an algorithm this build does not implement.
    #[error("unsupported algorithm id: {0}")]
    UnsupportedAlgorithm(u8),

    /// A value cannot be encrypted under the field's algorithm.
    #[error("field '{field}' cannot be encrypted: {reason}")]
    FieldType {
        /// Dotted field path
        field: String,
        /// What is wrong with the value
        reason: String,
    },

    /// A filter targets an encrypted field in a way that cannot be rewritten.
    #[error("field '{field}' is not queryable: {reason}")]
    NonQueryableField {
        /// Dotted field path
        field: String,
        /// Why the filter cannot be rewritten
        reason: String,
    },

    /// An update operator other than `$set`/`$unset` touches an encrypted field.
    #[error("update operator '{operator}' is not supported on encrypted field '{field}'")]
    UnsupportedOperator {
        /// Dotted field path
        field: String,
        /// The offending operator
        operator: String,
    },

    /// Envelope bytes are malformed.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Schema definition is structurally invalid.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Key material has the wrong length.
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength {
        /// Expected key length in bytes
        expected: usize,
        /// Actual key length in bytes
        actual: usize,
    },

    /// Configuration could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Key provider operation failed
    #[error("key provider error: {0}")]
    KeyProvider(KeyProviderError),

    /// Persistence layer failure (key vault or document store).
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Returns `true` for failures a caller may retry with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::KeyProviderUnavailable(_)
                | Self::Timeout(_)
                | Self::Store(StoreError::Unavailable(_) | StoreError::Timeout(_))
        )
    }

    pub(crate) fn key_not_found(key_id: &KeyId) -> Self {
        Self::KeyNotFound(key_id.to_string())
    }
}

impl From<KeyProviderError> for Error {
    fn from(err: KeyProviderError) -> Self {
        match err {
            KeyProviderError::IntegrityFailed => Self::Integrity,
            KeyProviderError::Unavailable(msg) => Self::KeyProviderUnavailable(msg),
            KeyProviderError::Timeout(msg) => Self::Timeout(msg),
            KeyProviderError::Entropy(msg) => Self::Entropy(msg),
            other => Self::KeyProvider(other),
        }
    }
}

/// Errors specific to key provider operations.
#[derive(Debug)]
pub enum KeyProviderError {
    /// Master key material is malformed
    InvalidMasterKey(String),

    /// Data key wrapping failed
    WrapFailed(String),

    /// Wrapped data key failed authentication
    IntegrityFailed,

    /// Remote provider unreachable or rejected the call
    Unavailable(String),

    /// Remote provider did not answer in time
    Timeout(String),

    /// Random source failed while wrapping
    Entropy(String),

    /// I/O operation failed
    Io(std::io::Error),
}

impl fmt::Display for KeyProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMasterKey(msg) => write!(f, "invalid master key: {msg}"),
            Self::WrapFailed(msg) => write!(f, "data key wrap failed: {msg}"),
            Self::IntegrityFailed => write!(f, "wrapped data key failed authentication"),
            Self::Unavailable(msg) => write!(f, "provider unavailable: {msg}"),
            Self::Timeout(msg) => write!(f, "provider timed out: {msg}"),
            Self::Entropy(msg) => write!(f, "entropy source unavailable: {msg}"),
            Self::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for KeyProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyProviderError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors raised by persistence collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A record with this key id already exists
    #[error("duplicate key id: {0}")]
    DuplicateKey(String),

    /// An alternate name is already taken
    #[error("duplicate alt name: {0}")]
    DuplicateAltName(String),

    /// The addressed record does not exist
    #[error("record not found: {0}")]
    NotFound(String),

    /// The backend is unreachable or failed the request
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time
    #[error("backend timed out: {0}")]
    Timeout(String),

    /// The request was malformed for this backend
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_integrity_lifts_to_top_level() {
        let err = Error::from(KeyProviderError::IntegrityFailed);
        assert!(matches!(err, Error::Integrity));
    }

    #[test]
    fn test_provider_outages_are_retryable() {
        let unavailable = Error::from(KeyProviderError::Unavailable("connection refused".into()));
        let timeout = Error::from(KeyProviderError::Timeout("5s".into()));

        assert!(matches!(unavailable, Error::KeyProviderUnavailable(_)));
        assert!(matches!(timeout, Error::Timeout(_)));
        assert!(unavailable.is_retryable());
        assert!(timeout.is_retryable());
        assert!(!Error::Integrity.is_retryable());
        assert!(Error::from(StoreError::Timeout("find".into())).is_retryable());
        assert!(!Error::from(StoreError::DuplicateKey("1".into())).is_retryable());
    }

    #[test]
    fn test_other_provider_errors_stay_wrapped() {
        let err = Error::from(KeyProviderError::InvalidMasterKey("expected 96 bytes".into()));
        assert!(matches!(err, Error::KeyProvider(KeyProviderError::InvalidMasterKey(_))));
        assert_eq!(err.to_string(), "key provider error: invalid master key: expected 96 bytes");
    }
}
