//! Associated context bound into every field ciphertext.

use std::fmt;

use crate::data_key::KeyId;

/// Location and key of an encrypted field, authenticated with the ciphertext.
///
/// The context ensures that:
/// - An envelope moved to another field fails authentication
/// - An envelope moved to another collection fails authentication
/// - An envelope whose key id was swapped fails authentication
///
/// # Example
///
/// ```
/// use fledoc::context::EncryptionContext;
/// use fledoc::data_key::KeyId;
///
/// let key_id: KeyId = "6f1d3a4e-2b7c-4d8e-9f0a-1b2c3d4e5f60".parse().unwrap();
/// let ctx = EncryptionContext::new("user", "accountNumber", key_id);
/// assert_eq!(ctx.to_string(), "user|accountNumber|6f1d3a4e-2b7c-4d8e-9f0a-1b2c3d4e5f60");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    collection: String,
    field_path: String,
    key_id: KeyId,
}

impl EncryptionContext {
    /// Creates a new encryption context.
    ///
    /// # Arguments
    ///
    /// * `collection` - Collection the document lives in
    /// * `field_path` - Dotted path of the field
    /// * `key_id` - Data key encrypting the field
    #[must_use]
    pub fn new(
        collection: impl Into<String>,
        field_path: impl Into<String>,
        key_id: KeyId,
    ) -> Self {
        Self {
            collection: collection.into(),
            field_path: field_path.into(),
            key_id,
        }
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the dotted field path.
    #[must_use]
    pub fn field_path(&self) -> &str {
        &self.field_path
    }

    /// Returns the data key id.
    #[must_use]
    pub const fn key_id(&self) -> KeyId {
        self.key_id
    }
}

impl fmt::Display for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.collection, self.field_path, self.key_id)
    }
}
