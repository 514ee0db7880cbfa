//! # fledoc
//!
//! Schema-driven client-side field-level encryption for document stores.
//!
//! Selected fields are encrypted before documents leave the process and
//! decrypted after they come back. The store only ever sees ciphertext.
//!
//! ## Features
//!
//! - AEAD_AES_256_CBC_HMAC_SHA_512 style authenticated encryption
//! - Deterministic mode for fields that need equality queries
//! - Envelope encryption: data keys wrapped by a master key
//! - Key alt names, key vault namespace, master key rotation
//! - `$jsonSchema`-style schema maps and TOML/JSON configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use fledoc::prelude::*;
//! use fledoc_key_local::LocalKeyProvider;
//!
//! let vault = Arc::new(DataKeyVault::new(LocalKeyProvider::generate()?, InMemoryKeyVault::new()));
//! let key_id = vault.create_data_key(["example"])?;
//!
//! let schemas = Arc::new(SchemaRegistry::new());
//! schemas.register(
//!     CollectionSchema::builder("fle-example.user")
//!         .metadata_key(key_id)
//!         .field("accountNumber", Algorithm::Deterministic)
//!         .build()?,
//! )?;
//!
//! let client = EncryptingCollectionClient::new(InMemoryDocumentStore::new(), vault, schemas);
//! client.insert("fle-example.user", doc)?;
//! let found = client.find("fle-example.user", &filter)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod context;
pub mod data_key;
pub mod engine;
pub mod envelope;
pub mod error;
mod json_schema;
pub mod key_provider;
pub mod key_vault;
pub mod schema;
pub mod store;
pub mod value;
pub mod vault;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::client::{BootstrapOptions, EncryptingCollectionClient};
    pub use crate::config::EncryptionConfig;
    pub use crate::context::EncryptionContext;
    pub use crate::data_key::{DataKey, DataKeyRecord, KeyId, MasterKey};
    pub use crate::envelope::{Algorithm, CipherEnvelope};
    pub use crate::error::{Error, KeyProviderError, StoreError};
    pub use crate::key_provider::KeyWrapProvider;
    pub use crate::key_vault::{InMemoryKeyVault, KeyVaultStore};
    pub use crate::schema::{CollectionSchema, EncryptionSpec, KeyRef, SchemaRegistry};
    pub use crate::store::{Document, DocumentStore, Filter, InMemoryDocumentStore, Update};
    pub use crate::value::ValueType;
    pub use crate::vault::{DataKeyVault, RotationReport};
    pub use std::sync::Arc;
}
