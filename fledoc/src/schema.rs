//! Which fields of which collections are encrypted, and how.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::data_key::KeyId;
use crate::envelope::Algorithm;
use crate::error::{Error, Result};
use crate::json_schema;
use crate::value::ValueType;

/// Reference to a data key from a schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRef {
    /// Key addressed by id
    Id(KeyId),
    /// Key addressed by one of its alt names
    AltName(String),
}

impl fmt::Display for KeyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::AltName(name) => write!(f, "alt name '{name}'"),
        }
    }
}

impl From<KeyId> for KeyRef {
    fn from(id: KeyId) -> Self {
        Self::Id(id)
    }
}

/// Encryption settings of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSpec {
    field_path: String,
    algorithm: Algorithm,
    key: KeyRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bson_type: Option<ValueType>,
}

impl EncryptionSpec {
    /// Creates a spec for the dotted `field_path`.
    #[must_use]
    pub fn new(
        field_path: impl Into<String>,
        algorithm: Algorithm,
        key: impl Into<KeyRef>,
    ) -> Self {
        Self {
            field_path: field_path.into(),
            algorithm,
            key: key.into(),
            bson_type: None,
        }
    }

    /// Pins the type values of this field must have.
    #[must_use]
    pub const fn with_bson_type(mut self, bson_type: ValueType) -> Self {
        self.bson_type = Some(bson_type);
        self
    }

    /// Returns the dotted field path.
    #[must_use]
    pub fn field_path(&self) -> &str {
        &self.field_path
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Returns the key reference.
    #[must_use]
    pub const fn key(&self) -> &KeyRef {
        &self.key
    }

    /// Returns the pinned value type, if any.
    #[must_use]
    pub const fn bson_type(&self) -> Option<ValueType> {
        self.bson_type
    }
}

/// Encrypted fields of one collection.
///
/// Deserialized schemas go through the same validation as
/// [`CollectionSchema::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SchemaParts")]
pub struct CollectionSchema {
    collection: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata_key: Option<KeyRef>,
    fields: Vec<EncryptionSpec>,
}

#[derive(Deserialize)]
struct SchemaParts {
    collection: String,
    #[serde(default)]
    metadata_key: Option<KeyRef>,
    fields: Vec<EncryptionSpec>,
}

impl TryFrom<SchemaParts> for CollectionSchema {
    type Error = Error;

    fn try_from(parts: SchemaParts) -> Result<Self> {
        let mut schema = Self::new(parts.collection, parts.fields)?;
        schema.metadata_key = parts.metadata_key;
        Ok(schema)
    }
}

impl CollectionSchema {
    /// Validates and creates a schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` for empty names or malformed paths, and
    /// `Error::SchemaConflict` if two paths are equal or one contains the other.
    pub fn new(collection: impl Into<String>, fields: Vec<EncryptionSpec>) -> Result<Self> {
        let collection = collection.into();
        check_fields(&collection, &fields)?;
        Ok(Self {
            collection,
            metadata_key: None,
            fields,
        })
    }

    /// Starts a builder whose fields may inherit a collection-wide key.
    #[must_use]
    pub fn builder(collection: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            collection: collection.into(),
            metadata_key: None,
            fields: Vec::new(),
        }
    }

    /// Parses a `$jsonSchema`-style document (`encryptMetadata`, nested
    /// `properties`, `encrypt` blocks).
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if the document is malformed.
    pub fn from_json_schema(collection: impl Into<String>, schema: &Value) -> Result<Self> {
        json_schema::parse(collection.into(), schema)
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the collection-wide default key.
    #[must_use]
    pub const fn metadata_key(&self) -> Option<&KeyRef> {
        self.metadata_key.as_ref()
    }

    /// Returns the encrypted fields in declaration order.
    #[must_use]
    pub fn fields(&self) -> &[EncryptionSpec] {
        &self.fields
    }
}

/// Builder for [`CollectionSchema`].
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    collection: String,
    metadata_key: Option<KeyRef>,
    fields: Vec<(String, Algorithm, Option<KeyRef>, Option<ValueType>)>,
}

impl SchemaBuilder {
    /// Sets the key used by fields that do not name their own.
    #[must_use]
    pub fn metadata_key(mut self, key: impl Into<KeyRef>) -> Self {
        self.metadata_key = Some(key.into());
        self
    }

    /// Adds a field using the metadata key.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>, algorithm: Algorithm) -> Self {
        self.fields.push((path.into(), algorithm, None, None));
        self
    }

    /// Adds a field with its own key.
    #[must_use]
    pub fn field_with_key(
        mut self,
        path: impl Into<String>,
        algorithm: Algorithm,
        key: impl Into<KeyRef>,
    ) -> Self {
        self.fields.push((path.into(), algorithm, Some(key.into()), None));
        self
    }

    /// Adds a field with an optional key and pinned type.
    #[must_use]
    pub fn typed_field(
        mut self,
        path: impl Into<String>,
        algorithm: Algorithm,
        key: Option<KeyRef>,
        bson_type: Option<ValueType>,
    ) -> Self {
        self.fields.push((path.into(), algorithm, key, bson_type));
        self
    }

    /// Validates and builds the schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if a field has no key and there is no
    /// metadata key, plus the errors of [`CollectionSchema::new`].
    pub fn build(self) -> Result<CollectionSchema> {
        let mut specs = Vec::with_capacity(self.fields.len());
        for (path, algorithm, key, bson_type) in self.fields {
            let key = key.or_else(|| self.metadata_key.clone()).ok_or_else(|| {
                Error::InvalidSchema(format!(
                    "field '{path}' in '{}' has no key and the collection has no metadata key",
                    self.collection
                ))
            })?;
            let mut spec = EncryptionSpec::new(path, algorithm, key);
            spec.bson_type = bson_type;
            specs.push(spec);
        }
        let mut schema = CollectionSchema::new(self.collection, specs)?;
        schema.metadata_key = self.metadata_key;
        Ok(schema)
    }
}

fn check_fields(collection: &str, fields: &[EncryptionSpec]) -> Result<()> {
    if collection.is_empty() {
        return Err(Error::InvalidSchema("collection name must not be empty".into()));
    }
    for spec in fields {
        validate_path(spec.field_path())?;
    }
    for (i, a) in fields.iter().enumerate() {
        for b in &fields[i + 1..] {
            check_overlap(collection, a.field_path(), b.field_path())?;
        }
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    let bad_segment = |segment: &str| segment.is_empty() || segment.starts_with('$');
    if path.is_empty() || path.split('.').any(bad_segment) {
        return Err(Error::InvalidSchema(format!("invalid field path '{path}'")));
    }
    Ok(())
}

/// Whether `ancestor` is `path` or one of its dotted prefixes.
pub(crate) fn is_path_prefix(ancestor: &str, path: &str) -> bool {
    path == ancestor
        || (path.len() > ancestor.len()
            && path.starts_with(ancestor)
            && path.as_bytes()[ancestor.len()] == b'.')
}

fn check_overlap(collection: &str, a: &str, b: &str) -> Result<()> {
    let detail = if a == b {
        format!("field '{a}' is declared twice")
    } else if is_path_prefix(a, b) || is_path_prefix(b, a) {
        format!("fields '{a}' and '{b}' overlap")
    } else {
        return Ok(());
    };
    Err(Error::SchemaConflict {
        collection: collection.to_string(),
        detail,
    })
}

/// Registry of collection schemas.
///
/// Schemas are registered during setup and then only read.
#[derive(Default)]
pub struct SchemaRegistry {
    collections: RwLock<HashMap<String, CollectionSchema>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, merging it with fields already registered for the
    /// same collection.
    ///
    /// Nothing is registered if any field conflicts.
    ///
    /// # Errors
    ///
    /// Returns `Error::SchemaConflict` if a field path equals or overlaps one
    /// already registered for the collection.
    pub fn register(&self, schema: CollectionSchema) -> Result<()> {
        check_fields(schema.collection(), schema.fields())?;
        let mut collections = self.collections.write();
        match collections.get_mut(schema.collection()) {
            Some(existing) => {
                for new in schema.fields() {
                    for old in existing.fields() {
                        check_overlap(schema.collection(), old.field_path(), new.field_path())?;
                    }
                }
                info!(
                    collection = schema.collection(),
                    fields = schema.fields.len(),
                    "extended schema"
                );
                if existing.metadata_key.is_none() {
                    existing.metadata_key = schema.metadata_key;
                }
                existing.fields.extend(schema.fields);
            }
            None => {
                info!(
                    collection = schema.collection(),
                    fields = schema.fields.len(),
                    "registered schema"
                );
                collections.insert(schema.collection.clone(), schema);
            }
        }
        Ok(())
    }

    /// Registers every schema of a `{"<namespace>": <$jsonSchema>}` map.
    ///
    /// All schemas are parsed before any is registered.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` for a malformed map and
    /// `Error::SchemaConflict` as [`SchemaRegistry::register`] does.
    pub fn register_schema_map(&self, map: &Value) -> Result<()> {
        let entries = map
            .as_object()
            .ok_or_else(|| Error::InvalidSchema("schema map must be an object".into()))?;
        let schemas = entries
            .iter()
            .map(|(namespace, schema)| {
                CollectionSchema::from_json_schema(namespace.as_str(), schema)
            })
            .collect::<Result<Vec<_>>>()?;
        for schema in schemas {
            self.register(schema)?;
        }
        Ok(())
    }

    /// Returns the encryption settings of `field_path` in `collection`.
    #[must_use]
    pub fn lookup(&self, collection: &str, field_path: &str) -> Option<EncryptionSpec> {
        self.collections
            .read()
            .get(collection)?
            .fields()
            .iter()
            .find(|spec| spec.field_path() == field_path)
            .cloned()
    }

    /// Returns the encrypted fields of `collection` in declaration order.
    #[must_use]
    pub fn fields_for(&self, collection: &str) -> Vec<EncryptionSpec> {
        self.collections.read().get(collection).map(|s| s.fields().to_vec()).unwrap_or_default()
    }

    /// Whether `collection` has a registered schema.
    #[must_use]
    pub fn contains(&self, collection: &str) -> bool {
        self.collections.read().contains_key(collection)
    }

    /// Returns a copy of the schema of `collection`.
    #[must_use]
    pub fn schema(&self, collection: &str) -> Option<CollectionSchema> {
        self.collections.read().get(collection).cloned()
    }

    /// Names of all registered collections, sorted.
    #[must_use]
    pub fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> KeyId {
        KeyId::from_bytes([1; 16])
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SchemaRegistry::new();
        let schema = CollectionSchema::builder("user")
            .metadata_key(key())
            .field("accountNumber", Algorithm::Deterministic)
            .field("profile.ssn", Algorithm::Randomized)
            .build()
            .unwrap();
        registry.register(schema).unwrap();

        let spec = registry.lookup("user", "accountNumber").expect("registered");
        assert_eq!(spec.algorithm(), Algorithm::Deterministic);
        assert_eq!(spec.key(), &KeyRef::Id(key()));

        assert!(registry.lookup("user", "name").is_none());
        assert!(registry.lookup("other", "accountNumber").is_none());

        let paths: Vec<_> = registry
            .fields_for("user")
            .iter()
            .map(|s| s.field_path().to_string())
            .collect();
        assert_eq!(paths, ["accountNumber", "profile.ssn"]);
    }

    #[test]
    fn test_same_path_twice_conflicts() {
        let registry = SchemaRegistry::new();
        let first = CollectionSchema::new(
            "user",
            vec![EncryptionSpec::new("ssn", Algorithm::Randomized, key())],
        )
        .unwrap();
        let second = CollectionSchema::new(
            "user",
            vec![
                EncryptionSpec::new("email", Algorithm::Deterministic, key()),
                EncryptionSpec::new("ssn", Algorithm::Deterministic, key()),
            ],
        )
        .unwrap();

        registry.register(first).unwrap();
        let result = registry.register(second);

        assert!(matches!(result, Err(Error::SchemaConflict { .. })));
        assert!(
            registry.lookup("user", "email").is_none(),
            "conflicting registration must not partially apply"
        );
        assert_eq!(registry.lookup("user", "ssn").unwrap().algorithm(), Algorithm::Randomized);
    }

    #[test]
    fn test_same_path_in_two_collections_is_independent() {
        let registry = SchemaRegistry::new();
        for collection in ["user", "admin"] {
            let schema = CollectionSchema::new(
                collection,
                vec![EncryptionSpec::new("ssn", Algorithm::Randomized, key())],
            )
            .unwrap();
            registry.register(schema).unwrap();
        }
        assert_eq!(registry.collections(), ["admin", "user"]);
    }

    #[test]
    fn test_duplicate_within_schema_conflicts() {
        let result = CollectionSchema::new(
            "user",
            vec![
                EncryptionSpec::new("ssn", Algorithm::Randomized, key()),
                EncryptionSpec::new("ssn", Algorithm::Deterministic, key()),
            ],
        );
        assert!(matches!(result, Err(Error::SchemaConflict { .. })));
    }

    #[test]
    fn test_deserialized_duplicate_paths_rejected() {
        let key = serde_json::to_value(KeyRef::Id(key())).unwrap();
        let json = serde_json::json!({
            "collection": "user",
            "fields": [
                { "field_path": "ssn", "algorithm": "randomized", "key": key },
                { "field_path": "ssn", "algorithm": "deterministic", "key": key },
            ]
        });

        let err = serde_json::from_value::<CollectionSchema>(json).unwrap_err();
        assert!(err.to_string().contains("declared twice"), "{err}");
    }

    #[test]
    fn test_deserialized_schema_round_trips_and_registers() {
        let schema = CollectionSchema::builder("user")
            .metadata_key(key())
            .field("ssn", Algorithm::Randomized)
            .build()
            .unwrap();
        let json = serde_json::to_value(&schema).unwrap();
        let back: CollectionSchema = serde_json::from_value(json).unwrap();
        assert_eq!(back, schema);

        let registry = SchemaRegistry::new();
        registry.register(back).unwrap();
        assert_eq!(registry.fields_for("user").len(), 1);
    }

    #[test]
    fn test_overlapping_paths_conflict() {
        let result = CollectionSchema::builder("user")
            .metadata_key(key())
            .field("profile", Algorithm::Randomized)
            .field("profile.ssn", Algorithm::Deterministic)
            .build();
        assert!(matches!(result, Err(Error::SchemaConflict { .. })));

        let ok = CollectionSchema::builder("user")
            .metadata_key(key())
            .field("profile", Algorithm::Randomized)
            .field("profiles.ssn", Algorithm::Deterministic)
            .build();
        assert!(ok.is_ok());
    }

    #[test]
    fn test_field_without_key_rejected() {
        let result = CollectionSchema::builder("user").field("ssn", Algorithm::Randomized).build();
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_invalid_paths_rejected() {
        for path in ["", "a..b", ".a", "a.", "$where", "a.$b"] {
            let result = CollectionSchema::new(
                "c",
                vec![EncryptionSpec::new(path, Algorithm::Randomized, key())],
            );
            assert!(matches!(result, Err(Error::InvalidSchema(_))), "{path:?}");
        }
    }

    #[test]
    fn test_is_path_prefix() {
        assert!(is_path_prefix("a", "a"));
        assert!(is_path_prefix("a", "a.b"));
        assert!(!is_path_prefix("a", "ab"));
        assert!(!is_path_prefix("a.b", "a"));
    }

    #[test]
    fn test_field_key_overrides_metadata_key() {
        let own = KeyRef::AltName("special".into());
        let schema = CollectionSchema::builder("user")
            .metadata_key(key())
            .field_with_key("ssn", Algorithm::Randomized, own.clone())
            .typed_field("age", Algorithm::Deterministic, None, Some(ValueType::Int))
            .build()
            .unwrap();

        assert_eq!(schema.fields()[0].key(), &own);
        assert_eq!(schema.fields()[1].key(), &KeyRef::Id(key()));
        assert_eq!(schema.fields()[1].bson_type(), Some(ValueType::Int));
        assert_eq!(schema.metadata_key(), Some(&KeyRef::Id(key())));
    }
}
