//! Document operations the encrypting client delegates to.
//!
//! Documents, filters and updates are JSON objects. Dotted paths address
//! nested fields (`"profile.ssn"`).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// A stored document.
pub type Document = Map<String, Value>;

/// A query filter such as `{"accountNumber": "123456"}`.
pub type Filter = Map<String, Value>;

/// A replacement document or an operator document (`{"$set": {...}}`).
pub type Update = Map<String, Value>;

/// Extended-JSON keys that denote a literal value rather than an operator.
const LITERAL_KEYS: [&str; 6] = [
    "$binary",
    "$uuid",
    "$oid",
    "$date",
    "$numberLong",
    "$numberDecimal",
];

/// Result of an insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOutcome {
    /// `_id` of the inserted document
    pub inserted_id: Value,
}

/// Result of an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Documents matching the filter
    pub matched: u64,
    /// Documents actually changed
    pub modified: u64,
}

/// Backend executing plain document operations.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait DocumentStore: Send + Sync {
    /// Inserts one document.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` if the `_id` is taken, or a backend error.
    fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome, StoreError>;

    /// Returns every document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidRequest` for unsupported filters, or a backend error.
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError>;

    /// Applies `update` to every document matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidRequest` for unsupported updates, or a backend error.
    fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn insert(&self, collection: &str, document: Document) -> Result<InsertOutcome, StoreError> {
        (**self).insert(collection, document)
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        (**self).find(collection, filter)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError> {
        (**self).update(collection, filter, update)
    }
}

/// In-process document store for tests and the demo.
///
/// Supports dotted-path equality, `$eq`, `$ne`, `$in`, `$nin`, `$and`,
/// `$or`, `$nor`, `$set`, `$unset` and replacement updates.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every document of `collection` exactly as stored.
    #[must_use]
    pub fn raw_documents(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn insert(
        &self,
        collection: &str,
        mut document: Document,
    ) -> Result<InsertOutcome, StoreError> {
        let id = document
            .entry("_id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();

        let mut collections = self.collections.write();
        let documents = collections.entry(collection.to_string()).or_default();
        if documents.iter().any(|d| d.get("_id") == Some(&id)) {
            return Err(StoreError::DuplicateKey(id.to_string()));
        }
        documents.push(document);
        debug!(collection, "inserted document");
        Ok(InsertOutcome { inserted_id: id })
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read();
        let Some(documents) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for document in documents {
            if matches_filter(document, filter)? {
                found.push(document.clone());
            }
        }
        Ok(found)
    }

    fn update(
        &self,
        collection: &str,
        filter: &Filter,
        update: &Update,
    ) -> Result<UpdateOutcome, StoreError> {
        let operators = is_operator_update(update)?;
        let mut collections = self.collections.write();
        let Some(documents) = collections.get_mut(collection) else {
            return Ok(UpdateOutcome::default());
        };

        // Compute every new version first so a failing update changes nothing.
        let mut changes = Vec::new();
        for (index, document) in documents.iter().enumerate() {
            if !matches_filter(document, filter)? {
                continue;
            }
            let updated = if operators {
                apply_operators(document, update)?
            } else {
                replace_keeping_id(document, update)
            };
            changes.push((index, updated));
        }

        let mut outcome = UpdateOutcome::default();
        for (index, updated) in changes {
            outcome.matched += 1;
            if documents[index] != updated {
                documents[index] = updated;
                outcome.modified += 1;
            }
        }
        debug!(
            collection,
            matched = outcome.matched,
            modified = outcome.modified,
            "updated documents"
        );
        Ok(outcome)
    }
}

/// Whether `value` is an object of query operators, as opposed to a literal.
pub(crate) fn is_operator_document(value: &Value) -> bool {
    value.as_object().is_some_and(|map| {
        !map.is_empty()
            && map.keys().all(|k| k.starts_with('$'))
            && !map.keys().any(|k| LITERAL_KEYS.contains(&k.as_str()))
    })
}

/// Whether `update` is an operator document. Mixed documents are rejected.
pub(crate) fn is_operator_update(update: &Update) -> Result<bool, StoreError> {
    let operators = update.keys().filter(|k| k.starts_with('$')).count();
    match operators {
        0 => Ok(false),
        n if n == update.len() => Ok(true),
        _ => Err(StoreError::InvalidRequest("update mixes operators and fields".into())),
    }
}

/// Returns the value at a dotted path.
pub(crate) fn get_path<'a>(document: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = document.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn set_path(document: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    let (parents, leaf) = match path.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, path),
    };
    let mut target = document;
    if let Some(parents) = parents {
        for segment in parents.split('.') {
            let next = target
                .entry(segment)
                .or_insert_with(|| Value::Object(Map::new()));
            target = next.as_object_mut().ok_or_else(|| {
                StoreError::InvalidRequest(format!(
                    "cannot set '{path}': '{segment}' is not a document"
                ))
            })?;
        }
    }
    target.insert(leaf.to_string(), value);
    Ok(())
}

fn remove_path(document: &mut Document, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => document.remove(path),
        Some((parents, leaf)) => {
            let mut target = document;
            for segment in parents.split('.') {
                target = target.get_mut(segment)?.as_object_mut()?;
            }
            target.remove(leaf)
        }
    }
}

fn matches_filter(document: &Document, filter: &Filter) -> Result<bool, StoreError> {
    for (key, condition) in filter {
        let matched = match key.as_str() {
            "$and" => count_matches(document, key, condition)? == clause_count(condition),
            "$or" => count_matches(document, key, condition)? > 0,
            "$nor" => count_matches(document, key, condition)? == 0,
            other if other.starts_with('$') => {
                return Err(StoreError::InvalidRequest(format!(
                    "unsupported filter operator {other}"
                )))
            }
            path => matches_condition(get_path(document, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn count_matches(
    document: &Document,
    operator: &str,
    value: &Value,
) -> Result<usize, StoreError> {
    let mut count = 0;
    for clause in clauses(operator, value)? {
        if matches_filter(document, clause)? {
            count += 1;
        }
    }
    Ok(count)
}

fn clause_count(value: &Value) -> usize {
    value.as_array().map_or(0, Vec::len)
}

fn clauses<'a>(operator: &str, value: &'a Value) -> Result<Vec<&'a Filter>, StoreError> {
    let invalid = || StoreError::InvalidRequest(format!("{operator} expects an array of filters"));
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|c| c.as_object().ok_or_else(invalid))
        .collect()
}

fn matches_condition(actual: Option<&Value>, condition: &Value) -> Result<bool, StoreError> {
    if !is_operator_document(condition) {
        return Ok(equals(actual, condition));
    }
    let Some(operators) = condition.as_object() else {
        return Ok(false);
    };
    for (operator, operand) in operators {
        let matched = match operator.as_str() {
            "$eq" => equals(actual, operand),
            "$ne" => !equals(actual, operand),
            "$in" => list(operator, operand)?.iter().any(|v| equals(actual, v)),
            "$nin" => !list(operator, operand)?.iter().any(|v| equals(actual, v)),
            other => {
                return Err(StoreError::InvalidRequest(format!(
                    "unsupported query operator {other}"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn list<'a>(operator: &str, operand: &'a Value) -> Result<&'a Vec<Value>, StoreError> {
    operand
        .as_array()
        .ok_or_else(|| StoreError::InvalidRequest(format!("{operator} expects an array")))
}

fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(value) if value == expected => true,
        Some(Value::Array(items)) => items.contains(expected),
        Some(_) => false,
    }
}

fn replace_keeping_id(document: &Document, replacement: &Update) -> Document {
    let mut replaced = replacement.clone();
    if let Some(id) = document.get("_id") {
        replaced.insert("_id".to_string(), id.clone());
    }
    replaced
}

fn apply_operators(document: &Document, update: &Update) -> Result<Document, StoreError> {
    let mut updated = document.clone();
    for (operator, fields) in update {
        let fields = fields.as_object().ok_or_else(|| {
            StoreError::InvalidRequest(format!("{operator} expects a document"))
        })?;
        match operator.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(&mut updated, path, value.clone())?;
                }
            }
            "$unset" => {
                for path in fields.keys() {
                    remove_path(&mut updated, path);
                }
            }
            other => {
                return Err(StoreError::InvalidRequest(format!(
                    "unsupported update operator {other}"
                )))
            }
        }
    }
    Ok(updated)
}
