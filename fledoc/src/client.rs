//! Transparent field encryption around a [`DocumentStore`].
//!
//! Writes encrypt every registered field before they reach the store; reads
//! rewrite filters so deterministic fields can be matched, and decrypt every
//! envelope found in returned documents. All rewriting happens on copies, so
//! a failure never leaves a half-encrypted document behind.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::context::EncryptionContext;
use crate::data_key::KeyId;
use crate::engine;
use crate::envelope::{Algorithm, CipherEnvelope};
use crate::error::{Error, Result, StoreError};
use crate::schema::{is_path_prefix, CollectionSchema, EncryptionSpec, KeyRef, SchemaRegistry};
use crate::store::{
    is_operator_document, is_operator_update, Document, DocumentStore, Filter, InsertOutcome,
    Update, UpdateOutcome,
};
use crate::value;
use crate::vault::DataKeyVault;

/// Settings for [`EncryptingCollectionClient::bootstrap`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOptions {
    /// Collection to protect
    pub collection: String,
    /// Alt name of the data key to reuse or create
    pub key_alt_name: String,
    /// Fields to encrypt under that key
    pub fields: Vec<(String, Algorithm)>,
}

impl BootstrapOptions {
    /// Starts options for `collection` using the key named `key_alt_name`.
    #[must_use]
    pub fn new(collection: impl Into<String>, key_alt_name: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            key_alt_name: key_alt_name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds an encrypted field.
    #[must_use]
    pub fn field(mut self, path: impl Into<String>, algorithm: Algorithm) -> Self {
        self.fields.push((path.into(), algorithm));
        self
    }
}

/// Document client that encrypts and decrypts registered fields.
///
/// # Example
///
/// ```ignore
/// let client = EncryptingCollectionClient::new(store, vault, schemas);
/// client.insert("user", doc)?;
/// let found = client.find("user", &filter)?;
/// ```
pub struct EncryptingCollectionClient<S> {
    store: S,
    vault: Arc<DataKeyVault>,
    schemas: Arc<SchemaRegistry>,
}

impl<S: DocumentStore> EncryptingCollectionClient<S> {
    /// Creates a client over `store`.
    pub const fn new(store: S, vault: Arc<DataKeyVault>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            vault,
            schemas,
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Returns the data key vault.
    #[must_use]
    pub fn vault(&self) -> &Arc<DataKeyVault> {
        &self.vault
    }

    /// Returns the schema registry.
    #[must_use]
    pub fn schemas(&self) -> &Arc<SchemaRegistry> {
        &self.schemas
    }

    /// Encrypts the registered fields of `document` and inserts it.
    ///
    /// # Errors
    ///
    /// Returns `Error::FieldType` if a value cannot be encrypted with its
    /// field's algorithm, `Error::KeyNotFound` if a schema key is missing,
    /// or the store's error.
    pub fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome> {
        let encrypted = self.encrypt_document(collection, &document)?;
        Ok(self.store.insert(collection, encrypted)?)
    }

    /// Encrypts every document, then inserts them in order.
    ///
    /// Nothing is inserted if any document fails to encrypt.
    ///
    /// # Errors
    ///
    /// Returns the first encryption error, or the first store error; documents
    /// inserted before a store error stay inserted.
    pub fn insert_many<I>(&self, collection: &str, documents: I) -> Result<Vec<InsertOutcome>>
    where
        I: IntoIterator<Item = Document>,
    {
        let encrypted = documents
            .into_iter()
            .map(|document| self.encrypt_document(collection, &document))
            .collect::<Result<Vec<_>>>()?;
        encrypted
            .into_iter()
            .map(|document| self.store.insert(collection, document).map_err(Error::from))
            .collect()
    }

    /// Finds documents matching `filter` and returns them decrypted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NonQueryableField` if the filter constrains a field
    /// that cannot be matched, `Error::KeyNotFound` or `Error::Integrity` if
    /// any returned envelope cannot be decrypted, or the store's error.
    pub fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>> {
        let rewritten = self.encrypt_filter(collection, filter)?;
        let documents = self.store.find(collection, &rewritten)?;
        debug!(collection, count = documents.len(), "decrypting query results");
        documents
            .iter()
            .map(|document| self.decrypt_document(collection, document))
            .collect()
    }

    /// Returns the first decrypted document matching `filter`.
    ///
    /// # Errors
    ///
    /// Same as [`EncryptingCollectionClient::find`].
    pub fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Document>> {
        let rewritten = self.encrypt_filter(collection, filter)?;
        self.store
            .find(collection, &rewritten)?
            .first()
            .map(|document| self.decrypt_document(collection, document))
            .transpose()
    }

    /// Updates documents matching `filter`.
    ///
    /// `update` is a replacement document or an operator document; `$set`
    /// values are encrypted and `$unset` passes through.
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedOperator` if another operator touches an
    /// encrypted field, plus the errors of `insert` and `find`.
    pub fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome> {
        let rewritten_filter = self.encrypt_filter(collection, filter)?;
        let rewritten_update = self.encrypt_update(collection, update)?;
        Ok(self
            .store
            .update(collection, &rewritten_filter, &rewritten_update)?)
    }

    /// Returns a copy of `document` with every registered field encrypted.
    ///
    /// Registered paths absent from the document are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Error::FieldType` for values that cannot be encrypted.
    pub fn encrypt_document(&self, collection: &str, document: &Document) -> Result<Document> {
        let specs = self.schemas.fields_for(collection);
        let mut encrypted = document.clone();
        let count = self.encrypt_paths(collection, &specs, None, &mut encrypted, false)?;
        if count > 0 {
            debug!(collection, fields = count, "encrypted document fields");
        }
        Ok(encrypted)
    }

    /// Returns a copy of `document` with every envelope decrypted.
    ///
    /// Envelopes are decrypted wherever they occur, using their own key id and
    /// their location as context.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if a referenced key no longer exists, and
    /// `Error::Integrity` if an envelope fails authentication.
    pub fn decrypt_document(&self, collection: &str, document: &Document) -> Result<Document> {
        let mut decrypted = Map::with_capacity(document.len());
        for (name, value) in document {
            decrypted.insert(name.clone(), self.decrypt_tree(collection, name, value)?);
        }
        Ok(decrypted)
    }

    /// Rewrites `filter` so it matches encrypted documents.
    ///
    /// # Errors
    ///
    /// Returns `Error::NonQueryableField` for conditions on randomized fields,
    /// inside encrypted values, or with operators other than equality. On a
    /// collection with encrypted fields, top-level operators other than
    /// `$and`, `$or` and `$nor` are rejected the same way.
    pub fn encrypt_filter(&self, collection: &str, filter: &Filter) -> Result<Filter> {
        let specs = self.schemas.fields_for(collection);
        if specs.is_empty() {
            return Ok(filter.clone());
        }
        self.rewrite_filter(collection, &specs, filter)
    }

    /// Encrypts one value explicitly, outside any schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::FieldType` if the value cannot use `algorithm`, or
    /// `Error::KeyNotFound` if `key` does not resolve.
    pub fn encrypt_value(
        &self,
        value: &Value,
        algorithm: Algorithm,
        key: &KeyRef,
        collection: &str,
        field_path: &str,
    ) -> Result<Value> {
        self.encrypt_with(collection, field_path, algorithm, key, value)
    }

    /// Decrypts one envelope explicitly.
    ///
    /// `collection` and `field_path` must be those used to encrypt it.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidEnvelope` if `value` is not an envelope, and
    /// `Error::Integrity` if the context or key does not match.
    pub fn decrypt_value(
        &self,
        value: &Value,
        collection: &str,
        field_path: &str,
    ) -> Result<Value> {
        match CipherEnvelope::from_value(value) {
            Some(envelope) => self.decrypt_envelope(collection, field_path, &envelope?),
            None => Err(Error::InvalidEnvelope("value is not encrypted".into())),
        }
    }

    /// Makes sure `options.collection` is protected, returning its key id.
    ///
    /// If the collection already has a schema nothing is created. Otherwise
    /// the key named `options.key_alt_name` is reused or created, and a
    /// schema encrypting `options.fields` with it is registered. Repeated or
    /// concurrent calls converge on one key and one schema.
    ///
    /// # Errors
    ///
    /// Returns the vault's or the registry's error.
    pub fn bootstrap(&self, options: BootstrapOptions) -> Result<KeyId> {
        if let Some(existing) = self.schemas.schema(&options.collection) {
            return self.existing_key(&existing, &options.key_alt_name);
        }

        let alt_name = options.key_alt_name.as_str();
        let key_id = match self.vault.resolve_by_alt_name(alt_name) {
            Ok(id) => id,
            Err(Error::KeyNotFound(_)) => match self.vault.create_data_key([alt_name]) {
                Ok(id) => id,
                // Another caller created it first.
                Err(Error::DuplicateAltName(_)) => self.vault.resolve_by_alt_name(alt_name)?,
                Err(e) => return Err(e),
            },
            Err(e) => return Err(e),
        };

        let mut builder =
            CollectionSchema::builder(options.collection.as_str()).metadata_key(key_id);
        for (path, algorithm) in options.fields {
            builder = builder.field(path, algorithm);
        }
        match self.schemas.register(builder.build()?) {
            Ok(()) => {
                info!(
                    collection = %options.collection,
                    key_id = %key_id,
                    "bootstrapped encrypted collection"
                );
                Ok(key_id)
            }
            Err(Error::SchemaConflict { .. }) if self.schemas.contains(&options.collection) => {
                let existing = self.schemas.schema(&options.collection);
                existing.map_or(Ok(key_id), |schema| {
                    self.existing_key(&schema, &options.key_alt_name)
                })
            }
            Err(e) => Err(e),
        }
    }

    fn existing_key(&self, schema: &CollectionSchema, alt_name: &str) -> Result<KeyId> {
        let key = schema
            .metadata_key()
            .or_else(|| schema.fields().first().map(EncryptionSpec::key));
        match key {
            Some(key) => self.vault.resolve(key),
            None => self.vault.resolve_by_alt_name(alt_name),
        }
    }

    fn encrypt_with(
        &self,
        collection: &str,
        field_path: &str,
        algorithm: Algorithm,
        key: &KeyRef,
        value: &Value,
    ) -> Result<Value> {
        let plaintext = value::encode(field_path, value, algorithm)?;
        let key_id = self.vault.resolve(key)?;
        let data_key = self.vault.get_data_key(&key_id)?;
        let context = EncryptionContext::new(collection, field_path, key_id);
        engine::encrypt(&plaintext, &data_key, algorithm, &context)?.to_value()
    }

    fn encrypt_field(
        &self,
        collection: &str,
        spec: &EncryptionSpec,
        value: &Value,
    ) -> Result<Value> {
        if let Some(expected) = spec.bson_type() {
            if !expected.matches(value) {
                return Err(Error::FieldType {
                    field: spec.field_path().to_string(),
                    reason: format!("expected {expected:?} value"),
                });
            }
        }
        self.encrypt_with(
            collection,
            spec.field_path(),
            spec.algorithm(),
            spec.key(),
            value,
        )
    }

    fn decrypt_envelope(
        &self,
        collection: &str,
        field_path: &str,
        envelope: &CipherEnvelope,
    ) -> Result<Value> {
        let key_id = envelope.key_id();
        let data_key = self.vault.get_data_key(&key_id)?;
        let context = EncryptionContext::new(collection, field_path, key_id);
        let plaintext = engine::decrypt(envelope, &data_key, &context)?;
        value::decode(&plaintext)
    }

    fn decrypt_tree(&self, collection: &str, path: &str, value: &Value) -> Result<Value> {
        if let Some(envelope) = CipherEnvelope::from_value(value) {
            return self.decrypt_envelope(collection, path, &envelope?);
        }
        match value {
            Value::Object(map) => {
                let mut decrypted = Map::with_capacity(map.len());
                for (name, child) in map {
                    let child_path = format!("{path}.{name}");
                    let child = self.decrypt_tree(collection, &child_path, child)?;
                    decrypted.insert(name.clone(), child);
                }
                Ok(Value::Object(decrypted))
            }
            // Array elements share the array's path.
            Value::Array(items) => items
                .iter()
                .map(|item| self.decrypt_tree(collection, path, item))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            other => Ok(other.clone()),
        }
    }

    /// Encrypts registered fields inside `target`, which sits at `prefix`
    /// (`None` for a whole document). Returns the number of fields encrypted.
    fn encrypt_paths(
        &self,
        collection: &str,
        specs: &[EncryptionSpec],
        prefix: Option<&str>,
        target: &mut Document,
        for_query: bool,
    ) -> Result<usize> {
        let mut count = 0;
        for spec in specs {
            let path = spec.field_path();
            let relative = match prefix {
                None => path,
                Some(prefix) if path.len() > prefix.len() && is_path_prefix(prefix, path) => {
                    &path[prefix.len() + 1..]
                }
                Some(_) => continue,
            };
            let Some(slot) = field_mut(target, relative, spec.field_path())? else {
                continue;
            };
            if for_query && !spec.algorithm().is_queryable() {
                return Err(non_queryable(spec.field_path()));
            }
            *slot = self.encrypt_field(collection, spec, slot)?;
            count += 1;
        }
        Ok(count)
    }

    fn rewrite_filter(
        &self,
        collection: &str,
        specs: &[EncryptionSpec],
        filter: &Filter,
    ) -> Result<Filter> {
        let mut rewritten = Map::with_capacity(filter.len());
        for (key, condition) in filter {
            let condition = match key.as_str() {
                "$and" | "$or" | "$nor" => {
                    let not_clauses =
                        || StoreError::InvalidRequest(format!("{key} expects an array of filters"));
                    let clauses = condition.as_array().ok_or_else(not_clauses)?;
                    let mut out = Vec::with_capacity(clauses.len());
                    for clause in clauses {
                        let clause = clause.as_object().ok_or_else(not_clauses)?;
                        out.push(Value::Object(self.rewrite_filter(collection, specs, clause)?));
                    }
                    Value::Array(out)
                }
                operator if operator.starts_with('$') => {
                    return Err(Error::NonQueryableField {
                        field: operator.to_string(),
                        reason: "only $and, $or and $nor are rewritten at the top level".into(),
                    });
                }
                path => self.rewrite_condition(collection, specs, path, condition)?,
            };
            rewritten.insert(key.clone(), condition);
        }
        Ok(rewritten)
    }

    fn rewrite_condition(
        &self,
        collection: &str,
        specs: &[EncryptionSpec],
        path: &str,
        condition: &Value,
    ) -> Result<Value> {
        if let Some(spec) = specs.iter().find(|s| s.field_path() == path) {
            if !spec.algorithm().is_queryable() {
                return Err(non_queryable(path));
            }
            return map_operands(path, condition, &mut |operand: &Value| {
                self.encrypt_field(collection, spec, operand)
            });
        }
        if let Some(spec) = specs.iter().find(|s| is_path_prefix(s.field_path(), path)) {
            return Err(Error::NonQueryableField {
                field: path.to_string(),
                reason: format!("it lies inside encrypted field '{}'", spec.field_path()),
            });
        }
        if specs.iter().any(|s| is_path_prefix(path, s.field_path())) {
            return map_operands(path, condition, &mut |operand: &Value| match operand {
                Value::Object(subdocument) => {
                    let mut encrypted = subdocument.clone();
                    self.encrypt_paths(collection, specs, Some(path), &mut encrypted, true)?;
                    Ok(Value::Object(encrypted))
                }
                other => Ok(other.clone()),
            });
        }
        Ok(condition.clone())
    }

    fn encrypt_update(&self, collection: &str, update: &Update) -> Result<Update> {
        let specs = self.schemas.fields_for(collection);
        if specs.is_empty() {
            return Ok(update.clone());
        }
        if !is_operator_update(update)? {
            return self.encrypt_document(collection, update);
        }

        let mut rewritten = update.clone();
        for (operator, fields) in &mut rewritten {
            let Some(fields) = fields.as_object_mut() else {
                continue;
            };
            match operator.as_str() {
                "$set" => {
                    for (path, value) in fields.iter_mut() {
                        *value = self.encrypt_set_value(collection, &specs, path, value)?;
                    }
                }
                "$unset" => {}
                other => {
                    if let Some(path) = fields.keys().find(|path| touches_encrypted(&specs, path)) {
                        return Err(Error::UnsupportedOperator {
                            field: path.clone(),
                            operator: other.to_string(),
                        });
                    }
                }
            }
        }
        Ok(rewritten)
    }

    fn encrypt_set_value(
        &self,
        collection: &str,
        specs: &[EncryptionSpec],
        path: &str,
        value: &Value,
    ) -> Result<Value> {
        if let Some(spec) = specs.iter().find(|s| s.field_path() == path) {
            return self.encrypt_field(collection, spec, value);
        }
        if specs.iter().any(|s| is_path_prefix(s.field_path(), path)) {
            return Err(Error::UnsupportedOperator {
                field: path.to_string(),
                operator: "$set".into(),
            });
        }
        let holds_encrypted = specs.iter().any(|s| is_path_prefix(path, s.field_path()));
        match value {
            Value::Object(subdocument) if holds_encrypted => {
                let mut encrypted = subdocument.clone();
                self.encrypt_paths(collection, specs, Some(path), &mut encrypted, false)?;
                Ok(Value::Object(encrypted))
            }
            other => Ok(other.clone()),
        }
    }
}

/// Applies `encrypt` to every equality operand of `condition`.
fn map_operands(
    path: &str,
    condition: &Value,
    encrypt: &mut dyn FnMut(&Value) -> Result<Value>,
) -> Result<Value> {
    let mut encrypt_operand = |operand: &Value| {
        if operand.is_null() {
            Ok(Value::Null)
        } else {
            encrypt(operand)
        }
    };

    if !is_operator_document(condition) {
        return encrypt_operand(condition);
    }
    let mut rewritten = Map::new();
    if let Some(operators) = condition.as_object() {
        for (operator, operand) in operators {
            let value = match operator.as_str() {
                "$eq" | "$ne" => encrypt_operand(operand)?,
                "$in" | "$nin" => {
                    let items = operand.as_array().ok_or_else(|| {
                        StoreError::InvalidRequest(format!("{operator} expects an array"))
                    })?;
                    let encrypted = items
                        .iter()
                        .map(&mut encrypt_operand)
                        .collect::<Result<Vec<_>>>()?;
                    Value::Array(encrypted)
                }
                other => {
                    return Err(Error::NonQueryableField {
                        field: path.to_string(),
                        reason: format!("operator {other} cannot match encrypted values"),
                    })
                }
            };
            rewritten.insert(operator.clone(), value);
        }
    }
    Ok(Value::Object(rewritten))
}

fn non_queryable(field: &str) -> Error {
    Error::NonQueryableField {
        field: field.to_string(),
        reason: "randomized encryption cannot be queried".into(),
    }
}

fn touches_encrypted(specs: &[EncryptionSpec], path: &str) -> bool {
    specs
        .iter()
        .any(|s| is_path_prefix(s.field_path(), path) || is_path_prefix(path, s.field_path()))
}

/// Finds the value at `relative` inside `document`. Encrypted paths never
/// descend into arrays; meeting one is an error rather than a silent skip.
fn field_mut<'a>(
    document: &'a mut Document,
    relative: &str,
    full_path: &str,
) -> Result<Option<&'a mut Value>> {
    let mut segments = relative.split('.');
    let Some(first) = segments.next() else {
        return Ok(None);
    };
    let Some(mut current) = document.get_mut(first) else {
        return Ok(None);
    };
    for segment in segments {
        current = match current {
            Value::Object(map) => match map.get_mut(segment) {
                Some(child) => child,
                None => return Ok(None),
            },
            Value::Array(_) => {
                return Err(Error::FieldType {
                    field: full_path.to_string(),
                    reason: "encrypted paths cannot pass through arrays".into(),
                })
            }
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}
