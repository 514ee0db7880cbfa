//! Data keys and the records that persist them.
//!
//! A data key is 96 random bytes. The first 32 bytes key AES-256-CBC, the
//! next 32 bytes key HMAC-SHA-512, and the last 32 bytes are reserved.
//! Data keys only ever leave process memory wrapped by a master key.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Size of an unwrapped data key in bytes.
pub const DATA_KEY_SIZE: usize = 96;

/// Size of each subkey carved out of a data key.
pub const SUBKEY_SIZE: usize = 32;

/// Fills `buf` from the operating system CSPRNG.
///
/// # Errors
///
/// Returns `Error::Entropy` if the OS source fails. There is no fallback.
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    OsRng.try_fill_bytes(buf).map_err(|e| Error::Entropy(e.to_string()))
}

/// 128-bit identifier of a data key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

impl KeyId {
    /// Generates a fresh random key id.
    #[must_use]
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds a key id from its 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the 16 raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidSchema(format!("invalid key id '{s}': {e}")))
    }
}

/// An unwrapped data key held in process memory.
///
/// The bytes are zeroized on drop and never printed by `Debug`.
pub struct DataKey {
    material: SecretVec<u8>,
}

impl DataKey {
    /// Wraps raw key material, checking its length.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKeyLength` unless the material is 96 bytes.
    pub fn from_secret(material: SecretVec<u8>) -> Result<Self> {
        let actual = material.expose_secret().len();
        if actual != DATA_KEY_SIZE {
            return Err(Error::InvalidKeyLength {
                expected: DATA_KEY_SIZE,
                actual,
            });
        }
        Ok(Self { material })
    }

    /// Generates a fresh random data key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Entropy` if the OS random source fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = vec![0u8; DATA_KEY_SIZE];
        fill_random(&mut bytes)?;
        Ok(Self {
            material: SecretVec::new(bytes),
        })
    }

    /// Subkey for AES-256-CBC.
    #[must_use]
    pub fn aes_key(&self) -> &[u8] {
        &self.material.expose_secret()[..SUBKEY_SIZE]
    }

    /// Subkey for HMAC-SHA-512.
    #[must_use]
    pub fn mac_key(&self) -> &[u8] {
        &self.material.expose_secret()[SUBKEY_SIZE..2 * SUBKEY_SIZE]
    }

    /// Whole key material, for wrapping.
    pub(crate) fn expose(&self) -> &[u8] {
        self.material.expose_secret()
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

/// Identifies the master key that wrapped a data key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MasterKey {
    /// Provider kind, e.g. `local` or `aws`
    pub provider: String,
    /// Provider-specific key reference (fingerprint, ARN, alias)
    pub key: String,
}

impl MasterKey {
    /// Creates a master key descriptor.
    #[must_use]
    pub fn new(provider: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.key)
    }
}

/// Persisted form of a data key, wrapped under a master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataKeyRecord {
    key_id: KeyId,
    #[serde(with = "wrapped_key_base64")]
    wrapped_key: Vec<u8>,
    alt_names: BTreeSet<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    key_material_version: u32,
    master_key: MasterKey,
}

impl DataKeyRecord {
    /// Creates a version-1 record.
    #[must_use]
    pub fn new(
        key_id: KeyId,
        wrapped_key: Vec<u8>,
        alt_names: BTreeSet<String>,
        master_key: MasterKey,
    ) -> Self {
        let now = Utc::now();
        Self {
            key_id,
            wrapped_key,
            alt_names,
            created_at: now,
            updated_at: now,
            key_material_version: 1,
            master_key,
        }
    }

    /// Returns the key id.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Returns the wrapped key bytes.
    #[must_use]
    pub fn wrapped_key(&self) -> &[u8] {
        &self.wrapped_key
    }

    /// Returns the alternate names.
    #[must_use]
    pub const fn alt_names(&self) -> &BTreeSet<String> {
        &self.alt_names
    }

    /// Returns the creation time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the last modification time.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns how many times the key has been wrapped.
    #[must_use]
    pub const fn key_material_version(&self) -> u32 {
        self.key_material_version
    }

    /// Returns the master key descriptor.
    #[must_use]
    pub const fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Returns a copy rewrapped under a different master key.
    #[must_use]
    pub fn rewrapped(&self, wrapped_key: Vec<u8>, master_key: MasterKey) -> Self {
        Self {
            wrapped_key,
            master_key,
            key_material_version: self.key_material_version.saturating_add(1),
            updated_at: Utc::now(),
            ..self.clone()
        }
    }

    pub(crate) fn insert_alt_name(&mut self, name: String) -> bool {
        let added = self.alt_names.insert(name);
        if added {
            self.updated_at = Utc::now();
        }
        added
    }

    pub(crate) fn remove_alt_name(&mut self, name: &str) -> bool {
        let removed = self.alt_names.remove(name);
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }
}

mod wrapped_key_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
