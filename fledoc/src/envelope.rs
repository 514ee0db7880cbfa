//! Self-describing ciphertext envelope for encrypted field values.
//!
//! Byte layout:
//! ```text
//! [subtype:1 = 0x06][algorithm:1][key_id:16][iv:16][ct_len:4 BE][ciphertext:ct_len][tag:32]
//! ```
//!
//! Inside a document the envelope travels as an extended-JSON binary value
//! with subtype `06`:
//! ```text
//! {"$binary": {"base64": "<layout above>", "subType": "06"}}
//! ```

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::data_key::KeyId;
use crate::error::{Error, Result};

/// Binary subtype marking an encrypted value.
pub const ENCRYPTED_SUBTYPE: u8 = 0x06;

/// Extended-JSON spelling of [`ENCRYPTED_SUBTYPE`].
pub const ENCRYPTED_SUBTYPE_HEX: &str = "06";

/// AES block size, also the IV size.
pub const IV_SIZE: usize = 16;

/// Truncated HMAC-SHA-512 tag size.
pub const TAG_SIZE: usize = 32;

const KEY_ID_SIZE: usize = 16;
const FIXED_SIZE: usize = 1 + 1 + KEY_ID_SIZE + IV_SIZE + 4 + TAG_SIZE;

/// Field encryption algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Same plaintext, context and key always yield the same envelope.
    /// Supports equality queries and leaks equality.
    #[serde(
        rename = "deterministic",
        alias = "Deterministic",
        alias = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"
    )]
    Deterministic,

    /// Fresh IV per encryption. Not queryable.
    #[serde(
        rename = "randomized",
        alias = "Randomized",
        alias = "AEAD_AES_256_CBC_HMAC_SHA_512-Random"
    )]
    Randomized,
}

impl Algorithm {
    /// Wire identifier.
    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Randomized => 2,
        }
    }

    /// Parses a wire identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedAlgorithm` for unknown identifiers.
    pub const fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Randomized),
            other => Err(Error::UnsupportedAlgorithm(other)),
        }
    }

    /// Whether ciphertexts of this algorithm support equality matching.
    #[must_use]
    pub const fn is_queryable(self) -> bool {
        matches!(self, Self::Deterministic)
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => f.write_str("AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic"),
            Self::Randomized => f.write_str("AEAD_AES_256_CBC_HMAC_SHA_512-Random"),
        }
    }
}

/// Encrypted field value with everything needed to decrypt it except the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    algorithm: Algorithm,
    key_id: KeyId,
    iv: [u8; IV_SIZE],
    ciphertext: Vec<u8>,
    tag: [u8; TAG_SIZE],
}

impl CipherEnvelope {
    /// Assembles an envelope from its parts.
    #[must_use]
    pub const fn new(
        algorithm: Algorithm,
        key_id: KeyId,
        iv: [u8; IV_SIZE],
        ciphertext: Vec<u8>,
        tag: [u8; TAG_SIZE],
    ) -> Self {
        Self {
            algorithm,
            key_id,
            iv,
            ciphertext,
            tag,
        }
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the id of the data key that encrypted the value.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Returns the IV.
    #[must_use]
    pub const fn iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Returns the CBC ciphertext.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Returns the authentication tag.
    #[must_use]
    pub const fn tag(&self) -> &[u8; TAG_SIZE] {
        &self.tag
    }

    /// Serializes the envelope to bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the ciphertext is longer than `u32::MAX` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let ct_len = u32::try_from(self.ciphertext.len()).map_err(|_| {
            Error::InvalidEnvelope(format!("ciphertext too long: {} bytes", self.ciphertext.len()))
        })?;

        let mut bytes = Vec::with_capacity(FIXED_SIZE + self.ciphertext.len());
        bytes.push(ENCRYPTED_SUBTYPE);
        bytes.push(self.algorithm.id());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&ct_len.to_be_bytes());
        bytes.extend_from_slice(&self.ciphertext);
        bytes.extend_from_slice(&self.tag);

        Ok(bytes)
    }

    /// Deserializes an envelope from bytes.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The subtype marker is wrong or the data is truncated
    /// - The algorithm id is unknown (`Error::UnsupportedAlgorithm`)
    /// - Bytes remain after the tag
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut reader = Reader { data, pos: 0 };

        let subtype = reader.byte("subtype")?;
        if subtype != ENCRYPTED_SUBTYPE {
            return Err(Error::InvalidEnvelope(format!("unexpected subtype {subtype:#04x}")));
        }

        let algorithm = Algorithm::from_id(reader.byte("algorithm id")?)?;
        let key_id = KeyId::from_bytes(reader.array::<KEY_ID_SIZE>("key id")?);
        let iv = reader.array::<IV_SIZE>("iv")?;

        let ct_len = u32::from_be_bytes(reader.array::<4>("ciphertext length")?) as usize;
        if ct_len == 0 || ct_len % IV_SIZE != 0 {
            return Err(Error::InvalidEnvelope(format!(
                "ciphertext length {ct_len} is not a positive multiple of the block size"
            )));
        }
        let ciphertext = reader.take(ct_len, "ciphertext")?.to_vec();
        let tag = reader.array::<TAG_SIZE>("tag")?;

        if reader.pos != data.len() {
            return Err(Error::InvalidEnvelope(format!(
                "{} trailing bytes after tag",
                data.len() - reader.pos
            )));
        }

        Ok(Self {
            algorithm,
            key_id,
            iv,
            ciphertext,
            tag,
        })
    }

    /// Encodes the envelope as an extended-JSON binary value.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        let encoded = STANDARD.encode(self.to_bytes()?);
        Ok(json!({ "$binary": { "base64": encoded, "subType": ENCRYPTED_SUBTYPE_HEX } }))
    }

    /// Decodes an envelope from an extended-JSON binary value.
    ///
    /// Returns `None` when `value` is not an encrypted binary at all, and
    /// `Some(Err(_))` when it is tagged as encrypted but cannot be parsed.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Result<Self>> {
        let encoded = encrypted_payload(value)?;
        Some(
            STANDARD
                .decode(encoded)
                .map_err(|e| Error::InvalidEnvelope(format!("invalid base64: {e}")))
                .and_then(|bytes| Self::from_bytes(&bytes)),
        )
    }
}

/// Returns `true` if `value` is tagged as an encrypted binary.
#[must_use]
pub fn is_encrypted_value(value: &Value) -> bool {
    encrypted_payload(value).is_some()
}

fn encrypted_payload(value: &Value) -> Option<&str> {
    let outer = value.as_object()?;
    if outer.len() != 1 {
        return None;
    }
    let binary = outer.get("$binary")?.as_object()?;
    let subtype = binary.get("subType")?.as_str()?;
    if !subtype.eq_ignore_ascii_case(ENCRYPTED_SUBTYPE_HEX) {
        return None;
    }
    binary.get("base64")?.as_str()
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Error::InvalidEnvelope(format!("{what} truncated")))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn byte(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }
}
