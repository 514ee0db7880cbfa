//! File-based encryption settings.
//!
//! ```toml
//! key_vault_namespace = "keyvault.datakeys"
//! kms_timeout_ms = 5000
//!
//! [schemas."fle-example.user"]
//! metadata_key = { alt_name = "example" }
//!
//! [[schemas."fle-example.user".fields]]
//! path = "accountNumber"
//! algorithm = "deterministic"
//! bson_type = "string"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::envelope::Algorithm;
use crate::error::{Error, Result};
use crate::key_vault::{InMemoryKeyVault, DEFAULT_KEY_VAULT_NAMESPACE};
use crate::schema::{CollectionSchema, KeyRef, SchemaRegistry};
use crate::value::ValueType;

const DEFAULT_KMS_TIMEOUT_MS: u64 = 10_000;

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionConfig {
    /// `database.collection` holding the key vault
    #[serde(default = "default_namespace")]
    pub key_vault_namespace: String,
    /// Deadline for each external key provider call
    #[serde(default = "default_kms_timeout_ms")]
    pub kms_timeout_ms: u64,
    /// Encrypted fields per collection
    #[serde(default)]
    pub schemas: BTreeMap<String, SchemaConfig>,
}

/// Encrypted fields of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    /// Key used by fields that do not name their own
    #[serde(default)]
    pub metadata_key: Option<KeyRef>,
    /// Field settings
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

/// Encryption settings of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    /// Dotted field path
    pub path: String,
    /// Encryption algorithm
    pub algorithm: Algorithm,
    /// Key override
    #[serde(default)]
    pub key: Option<KeyRef>,
    /// Required value type
    #[serde(default)]
    pub bson_type: Option<ValueType>,
}

fn default_namespace() -> String {
    DEFAULT_KEY_VAULT_NAMESPACE.to_string()
}

const fn default_kms_timeout_ms() -> u64 {
    DEFAULT_KMS_TIMEOUT_MS
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_vault_namespace: default_namespace(),
            kms_timeout_ms: DEFAULT_KMS_TIMEOUT_MS,
            schemas: BTreeMap::new(),
        }
    }
}

impl EncryptionConfig {
    /// Parses JSON settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid settings JSON.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the text is not valid settings TOML.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads settings from a `.json` or `.toml` file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read, has another
    /// extension, or does not parse.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text),
            Some("toml") => Self::from_toml_str(&text),
            _ => Err(Error::Config(format!(
                "unsupported config format for {}; use .json or .toml",
                path.display()
            ))),
        }?;
        debug!(
            path = %path.display(),
            collections = config.schemas.len(),
            "loaded encryption config"
        );
        Ok(config)
    }

    /// Deadline for external key provider calls.
    #[must_use]
    pub const fn kms_timeout(&self) -> Duration {
        Duration::from_millis(self.kms_timeout_ms)
    }

    /// Creates an empty in-memory key vault in the configured namespace.
    #[must_use]
    pub fn key_vault(&self) -> InMemoryKeyVault {
        InMemoryKeyVault::with_namespace(self.key_vault_namespace.as_str())
    }

    /// Builds the validated schema of every configured collection.
    ///
    /// # Errors
    ///
    /// Returns the schema validation error of the first invalid collection.
    pub fn collection_schemas(&self) -> Result<Vec<CollectionSchema>> {
        self.schemas
            .iter()
            .map(|(collection, schema)| {
                let mut builder = CollectionSchema::builder(collection.as_str());
                if let Some(key) = &schema.metadata_key {
                    builder = builder.metadata_key(key.clone());
                }
                for field in &schema.fields {
                    builder = builder.typed_field(
                        field.path.as_str(),
                        field.algorithm,
                        field.key.clone(),
                        field.bson_type,
                    );
                }
                builder.build()
            })
            .collect()
    }

    /// Registers every configured schema.
    ///
    /// All schemas are validated before any is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` or `Error::SchemaConflict`.
    pub fn register_all(&self, registry: &SchemaRegistry) -> Result<()> {
        let schemas = self.collection_schemas()?;
        let count = schemas.len();
        for schema in schemas {
            registry.register(schema)?;
        }
        info!(collections = count, "registered configured schemas");
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let malformed = self
            .key_vault_namespace
            .split_once('.')
            .map_or(true, |(db, coll)| db.is_empty() || coll.is_empty());
        if malformed {
            return Err(Error::Config(format!(
                "key_vault_namespace '{}' must look like 'database.collection'",
                self.key_vault_namespace
            )));
        }
        if self.kms_timeout_ms == 0 {
            return Err(Error::Config("kms_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
