//! Persistence of wrapped data keys.
//!
//! The key vault is a collection of its own, separate from application data.
//! Backends must enforce uniqueness of key ids and of every alt name; the
//! vault relies on that constraint to settle concurrent key creation.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use tracing::debug;

use crate::data_key::{DataKeyRecord, KeyId};
use crate::error::StoreError;

/// Namespace the original driver uses for the key vault.
pub const DEFAULT_KEY_VAULT_NAMESPACE: &str = "keyvault.datakeys";

/// CRUD over [`DataKeyRecord`]s.
///
/// Implementations must be thread-safe (`Send + Sync`).
pub trait KeyVaultStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::DuplicateKey` or `StoreError::DuplicateAltName`
    /// when a uniqueness constraint would be violated; nothing is written then.
    fn insert(&self, record: DataKeyRecord) -> Result<(), StoreError>;

    /// Loads a record by key id.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures; a missing record is `Ok(None)`.
    fn get(&self, key_id: &KeyId) -> Result<Option<DataKeyRecord>, StoreError>;

    /// Loads the record owning `alt_name`.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures.
    fn find_by_alt_name(&self, alt_name: &str) -> Result<Option<DataKeyRecord>, StoreError>;

    /// Lists all records.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures.
    fn list(&self) -> Result<Vec<DataKeyRecord>, StoreError>;

    /// Replaces an existing record atomically.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no record has the same key id, or
    /// `StoreError::DuplicateAltName` if the new alt names collide.
    fn replace(&self, record: DataKeyRecord) -> Result<(), StoreError>;

    /// Deletes a record, returning it if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures.
    fn delete(&self, key_id: &KeyId) -> Result<Option<DataKeyRecord>, StoreError>;
}

#[derive(Default)]
struct Records {
    by_id: BTreeMap<KeyId, DataKeyRecord>,
    alt_names: HashMap<String, KeyId>,
}

impl Records {
    fn check_alt_names(&self, record: &DataKeyRecord) -> Result<(), StoreError> {
        for name in record.alt_names() {
            match self.alt_names.get(name) {
                Some(owner) if *owner != record.key_id() => {
                    return Err(StoreError::DuplicateAltName(name.clone()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// In-process key vault, useful for tests and single-process deployments.
pub struct InMemoryKeyVault {
    namespace: String,
    records: RwLock<Records>,
}

impl InMemoryKeyVault {
    /// Creates an empty vault in the default namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_KEY_VAULT_NAMESPACE)
    }

    /// Creates an empty vault in `namespace` (`database.collection`).
    #[must_use]
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            records: RwLock::new(Records::default()),
        }
    }

    /// Returns the namespace.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().by_id.len()
    }

    /// Whether the vault holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().by_id.is_empty()
    }
}

impl Default for InMemoryKeyVault {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyVaultStore for InMemoryKeyVault {
    fn insert(&self, record: DataKeyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.by_id.contains_key(&record.key_id()) {
            return Err(StoreError::DuplicateKey(record.key_id().to_string()));
        }
        records.check_alt_names(&record)?;

        for name in record.alt_names() {
            records.alt_names.insert(name.clone(), record.key_id());
        }
        debug!(namespace = %self.namespace, key_id = %record.key_id(), "stored data key");
        records.by_id.insert(record.key_id(), record);
        Ok(())
    }

    fn get(&self, key_id: &KeyId) -> Result<Option<DataKeyRecord>, StoreError> {
        Ok(self.records.read().by_id.get(key_id).cloned())
    }

    fn find_by_alt_name(&self, alt_name: &str) -> Result<Option<DataKeyRecord>, StoreError> {
        let records = self.records.read();
        Ok(records.alt_names.get(alt_name).and_then(|id| records.by_id.get(id)).cloned())
    }

    fn list(&self) -> Result<Vec<DataKeyRecord>, StoreError> {
        Ok(self.records.read().by_id.values().cloned().collect())
    }

    fn replace(&self, record: DataKeyRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        let key_id = record.key_id();
        let old_names = match records.by_id.get(&key_id) {
            Some(old) => old.alt_names().clone(),
            None => return Err(StoreError::NotFound(key_id.to_string())),
        };
        records.check_alt_names(&record)?;

        for name in old_names.difference(record.alt_names()) {
            records.alt_names.remove(name);
        }
        for name in record.alt_names() {
            records.alt_names.insert(name.clone(), key_id);
        }
        records.by_id.insert(key_id, record);
        Ok(())
    }

    fn delete(&self, key_id: &KeyId) -> Result<Option<DataKeyRecord>, StoreError> {
        let mut records = self.records.write();
        let removed = records.by_id.remove(key_id);
        if let Some(record) = &removed {
            for name in record.alt_names() {
                records.alt_names.remove(name);
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_key::MasterKey;
    use std::collections::BTreeSet;

    fn record(names: &[&str]) -> DataKeyRecord {
        DataKeyRecord::new(
            KeyId::new_v4(),
            vec![0; 8],
            names.iter().map(|n| (*n).to_string()).collect::<BTreeSet<_>>(),
            MasterKey::new("local", "test"),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let vault = InMemoryKeyVault::new();
        let rec = record(&["example"]);
        vault.insert(rec.clone()).unwrap();

        assert_eq!(vault.get(&rec.key_id()).unwrap(), Some(rec.clone()));
        assert_eq!(vault.find_by_alt_name("example").unwrap(), Some(rec));
        assert_eq!(vault.find_by_alt_name("missing").unwrap(), None);
        assert_eq!(vault.namespace(), "keyvault.datakeys");
    }

    #[test]
    fn test_duplicate_alt_name_rejected_without_partial_write() {
        let vault = InMemoryKeyVault::new();
        vault.insert(record(&["a", "b"])).unwrap();

        let loser = record(&["c", "b"]);
        let result = vault.insert(loser.clone());

        assert!(matches!(result, Err(StoreError::DuplicateAltName(name)) if name == "b"));
        assert_eq!(vault.len(), 1);
        assert!(vault.find_by_alt_name("c").unwrap().is_none());
        assert!(vault.get(&loser.key_id()).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_key_id_rejected() {
        let vault = InMemoryKeyVault::new();
        let rec = record(&[]);
        vault.insert(rec.clone()).unwrap();

        assert!(matches!(vault.insert(rec), Err(StoreError::DuplicateKey(_))));
    }

    #[test]
    fn test_replace_updates_alt_name_index() {
        let vault = InMemoryKeyVault::new();
        let mut rec = record(&["old"]);
        vault.insert(rec.clone()).unwrap();

        rec.remove_alt_name("old");
        rec.insert_alt_name("new".to_string());
        vault.replace(rec.clone()).unwrap();

        assert!(vault.find_by_alt_name("old").unwrap().is_none());
        assert_eq!(vault.find_by_alt_name("new").unwrap().map(|r| r.key_id()), Some(rec.key_id()));
    }

    #[test]
    fn test_replace_missing_record() {
        let vault = InMemoryKeyVault::new();
        assert!(matches!(vault.replace(record(&[])), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_frees_alt_names() {
        let vault = InMemoryKeyVault::new();
        let rec = record(&["example"]);
        vault.insert(rec.clone()).unwrap();

        assert!(vault.delete(&rec.key_id()).unwrap().is_some());
        assert!(vault.is_empty());
        vault.insert(record(&["example"])).unwrap();
    }
}
