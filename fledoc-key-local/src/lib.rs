//! Local master key provider for fledoc.
//!
//! The master key is 96 random bytes kept in process memory, optionally
//! persisted as base64 in a file readable only by its owner. Data keys are
//! wrapped with ChaCha20-Poly1305 under a key derived from the master key
//! with HKDF-SHA256.
//!
//! Wrapped layout:
//! ```text
//! [nonce:12][ciphertext || tag:16]
//! ```
//!
//! Suitable for development and single-host deployments. Anyone holding the
//! master key file can read every encrypted field.

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use fledoc::data_key::MasterKey;
use fledoc::error::KeyProviderError;
use fledoc::key_provider::KeyWrapProvider;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Size of a local master key.
pub const MASTER_KEY_SIZE: usize = 96;

/// Provider name recorded in every data key this provider wraps.
pub const PROVIDER_NAME: &str = "local";

const NONCE_SIZE: usize = 12;
const AEAD_TAG_SIZE: usize = 16;
const WRAP_INFO: &[u8] = b"fledoc-local-wrap-v1";
const FINGERPRINT_LABEL: &[u8] = b"fledoc-local-fingerprint-v1";

/// Master key provider backed by a local 96-byte secret.
///
/// The master key descriptor is `local:<fingerprint>`, where the fingerprint
/// is a keyed hash of the secret. Two different secrets therefore never
/// claim each other's data keys.
pub struct LocalKeyProvider {
    material: SecretVec<u8>,
    wrapping_key: Zeroizing<[u8; 32]>,
    fingerprint: String,
}

impl LocalKeyProvider {
    /// Creates a provider from existing key material.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::InvalidMasterKey` unless `material` is
    /// exactly 96 bytes.
    pub fn new(material: SecretVec<u8>) -> Result<Self, KeyProviderError> {
        let len = material.expose_secret().len();
        if len != MASTER_KEY_SIZE {
            return Err(KeyProviderError::InvalidMasterKey(format!(
                "expected {MASTER_KEY_SIZE} bytes, got {len}"
            )));
        }

        let mut wrapping_key = Zeroizing::new([0u8; 32]);
        Hkdf::<Sha256>::new(None, material.expose_secret())
            .expand(WRAP_INFO, &mut wrapping_key[..])
            .map_err(|e| {
                KeyProviderError::InvalidMasterKey(format!("key derivation failed: {e}"))
            })?;

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(material.expose_secret())
            .map_err(|e| KeyProviderError::InvalidMasterKey(e.to_string()))?;
        mac.update(FINGERPRINT_LABEL);
        let fingerprint = hex::encode(&mac.finalize().into_bytes()[..8]);

        Ok(Self {
            material,
            wrapping_key,
            fingerprint,
        })
    }

    /// Generates a fresh random master key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::Entropy` if the OS random source fails.
    pub fn generate() -> Result<Self, KeyProviderError> {
        let mut material = vec![0u8; MASTER_KEY_SIZE];
        OsRng
            .try_fill_bytes(&mut material)
            .map_err(|e| KeyProviderError::Entropy(e.to_string()))?;
        info!(provider = PROVIDER_NAME, "generated local master key");
        Self::new(SecretVec::new(material))
    }

    /// Loads a master key from base64 text.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::InvalidMasterKey` if the text is not base64
    /// of 96 bytes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyProviderError> {
        let material = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyProviderError::InvalidMasterKey(format!("invalid base64: {e}")))?;
        Self::new(SecretVec::new(material))
    }

    /// Encodes the master key as base64.
    #[must_use]
    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.material.expose_secret()))
    }

    /// Loads a master key file written by [`LocalKeyProvider::write_to_file`].
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::Io` if the file cannot be read, or
    /// `KeyProviderError::InvalidMasterKey` if its content is malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, KeyProviderError> {
        let path = path.as_ref();
        let text = Zeroizing::new(std::fs::read_to_string(path)?);
        let provider = Self::from_base64(&text)?;
        debug!(
            path = %path.display(),
            master_key = %provider.master_key(),
            "loaded local master key"
        );
        Ok(provider)
    }

    /// Writes the master key to a new file as base64.
    ///
    /// On Unix the file is created with mode `0600`. Existing files are never
    /// overwritten.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::Io` if the file exists or cannot be written.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), KeyProviderError> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(path)?;
        file.write_all(self.to_base64().as_bytes())?;
        file.sync_all()?;
        info!(path = %path.display(), master_key = %self.master_key(), "wrote local master key");
        Ok(())
    }

    /// Keyed fingerprint identifying this master key.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.wrapping_key[..]))
    }
}

impl fmt::Debug for LocalKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyProvider")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl KeyWrapProvider for LocalKeyProvider {
    fn master_key(&self) -> MasterKey {
        MasterKey::new(PROVIDER_NAME, self.fingerprint.as_str())
    }

    fn wrap_key(&self, plaintext_key: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| KeyProviderError::Entropy(e.to_string()))?;

        let payload = Payload {
            msg: plaintext_key,
            aad: self.fingerprint.as_bytes(),
        };
        let ciphertext = self
            .cipher()
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|e| KeyProviderError::WrapFailed(e.to_string()))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_key(&self, wrapped_key: &[u8]) -> Result<SecretVec<u8>, KeyProviderError> {
        if wrapped_key.len() < NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(KeyProviderError::IntegrityFailed);
        }
        let (nonce, ciphertext) = wrapped_key.split_at(NONCE_SIZE);

        let payload = Payload {
            msg: ciphertext,
            aad: self.fingerprint.as_bytes(),
        };
        let plaintext = self
            .cipher()
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|_| KeyProviderError::IntegrityFailed)?;
        Ok(SecretVec::new(plaintext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(fill: u8) -> LocalKeyProvider {
        LocalKeyProvider::new(SecretVec::new(vec![fill; MASTER_KEY_SIZE])).unwrap()
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let provider = provider(7);
        let data_key = [0x42u8; 96];

        let wrapped = provider.wrap_key(&data_key).unwrap();
        assert_ne!(&wrapped[NONCE_SIZE..NONCE_SIZE + 96], &data_key[..]);

        let unwrapped = provider.unwrap_key(&wrapped).unwrap();
        assert_eq!(unwrapped.expose_secret(), &data_key);
    }

    #[test]
    fn test_wrapping_is_randomized() {
        let provider = provider(7);
        let a = provider.wrap_key(&[1; 96]).unwrap();
        let b = provider.wrap_key(&[1; 96]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_wrap_fails_integrity() {
        let provider = provider(7);
        let mut wrapped = provider.wrap_key(&[1; 96]).unwrap();
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;

        assert!(matches!(provider.unwrap_key(&wrapped), Err(KeyProviderError::IntegrityFailed)));
        assert!(matches!(provider.unwrap_key(&[0; 10]), Err(KeyProviderError::IntegrityFailed)));
    }

    #[test]
    fn test_other_master_key_cannot_unwrap() {
        let wrapped = provider(1).wrap_key(&[1; 96]).unwrap();
        assert!(matches!(provider(2).unwrap_key(&wrapped), Err(KeyProviderError::IntegrityFailed)));
    }

    #[test]
    fn test_master_key_descriptor() {
        let a = provider(1);
        let b = provider(2);

        assert_eq!(a.master_key().provider, "local");
        assert_eq!(a.master_key(), provider(1).master_key());
        assert_ne!(a.master_key(), b.master_key());
        assert_eq!(a.fingerprint().len(), 16);
    }

    #[test]
    fn test_invalid_length_rejected() {
        let result = LocalKeyProvider::new(SecretVec::new(vec![0; 32]));
        assert!(matches!(result, Err(KeyProviderError::InvalidMasterKey(_))));
    }

    #[test]
    fn test_base64_roundtrip() {
        let original = LocalKeyProvider::generate().unwrap();
        let restored = LocalKeyProvider::from_base64(&original.to_base64()).unwrap();
        assert_eq!(original.master_key(), restored.master_key());

        assert!(LocalKeyProvider::from_base64("not base64!").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");

        let original = LocalKeyProvider::generate().unwrap();
        original.write_to_file(&path).unwrap();
        let loaded = LocalKeyProvider::from_file(&path).unwrap();

        let wrapped = original.wrap_key(&[9; 96]).unwrap();
        assert_eq!(loaded.unwrap_key(&wrapped).unwrap().expose_secret(), &[9; 96]);

        assert!(matches!(original.write_to_file(&path), Err(KeyProviderError::Io(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        LocalKeyProvider::generate().unwrap().write_to_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_debug_hides_material() {
        let rendered = format!("{:?}", provider(0xAB));
        assert!(rendered.contains("fingerprint"));
        assert!(!rendered.contains("material"));
    }
}
