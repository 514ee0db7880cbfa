//! Key wrapping provider abstraction for master key operations.

use crate::data_key::MasterKey;
use crate::error::KeyProviderError;
use secrecy::SecretVec;

/// Wraps and unwraps data keys under a master key.
///
/// Implementations must be thread-safe (`Send + Sync`) so one provider can
/// serve concurrent vault lookups. Providers do not cache; that is the
/// vault's job.
///
/// # Example
///
/// ```rust,ignore
/// use fledoc::key_provider::KeyWrapProvider;
///
/// struct MyProvider;
///
/// impl KeyWrapProvider for MyProvider {
///     fn master_key(&self) -> MasterKey {
///         MasterKey::new("custom", "v1")
///     }
///     // ... wrap_key / unwrap_key
/// }
/// ```
pub trait KeyWrapProvider: Send + Sync {
    /// Describes the master key this provider wraps under.
    ///
    /// The descriptor is stored alongside every data key the provider wraps
    /// and is how the vault routes an unwrap to the right provider. Two
    /// providers holding different master keys must return different
    /// descriptors.
    fn master_key(&self) -> MasterKey;

    /// Wraps (encrypts) a plaintext data key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::WrapFailed` if wrapping fails,
    /// `KeyProviderError::Unavailable` or `KeyProviderError::Timeout` for
    /// remote providers that cannot be reached.
    fn wrap_key(&self, plaintext_key: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Unwraps (decrypts) a wrapped data key.
    ///
    /// # Returns
    ///
    /// Returns the plaintext key in a `SecretVec` for memory safety.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::IntegrityFailed` if the wrapped key does not
    /// authenticate under this master key.
    fn unwrap_key(&self, wrapped_key: &[u8]) -> Result<SecretVec<u8>, KeyProviderError>;
}
