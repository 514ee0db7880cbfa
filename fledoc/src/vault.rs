//! Data key lifecycle: creation, lookup, caching and master key rotation.
//!
//! The vault uses envelope encryption:
//! 1. Generate a random 96-byte data key
//! 2. Wrap it with the active master key through a [`KeyWrapProvider`]
//! 3. Persist only the wrapped form in a [`KeyVaultStore`]
//! 4. Unwrap on first use and keep the plaintext key in an in-memory cache

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::data_key::{DataKey, DataKeyRecord, KeyId, MasterKey};
use crate::error::{Error, Result, StoreError};
use crate::key_provider::KeyWrapProvider;
use crate::key_vault::KeyVaultStore;
use crate::schema::KeyRef;

/// Outcome of [`DataKeyVault::rotate_master_key`].
#[derive(Debug, Default)]
pub struct RotationReport {
    /// Keys now wrapped under the new master key
    pub rotated: Vec<KeyId>,
    /// Keys that were already under the new master key
    pub unchanged: Vec<KeyId>,
    /// Keys still wrapped under their previous master key
    pub failed: Vec<(KeyId, Error)>,
}

impl RotationReport {
    /// Whether every key ended up under the new master key.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Providers {
    active: Arc<dyn KeyWrapProvider>,
    by_master_key: HashMap<MasterKey, Arc<dyn KeyWrapProvider>>,
}

impl Providers {
    /// A record wrapped under a master key this vault does not hold cannot be
    /// authenticated, so it fails like a wrong master key would.
    fn for_record(&self, record: &DataKeyRecord) -> Result<Arc<dyn KeyWrapProvider>> {
        self.by_master_key.get(record.master_key()).cloned().ok_or_else(|| {
            warn!(
                key_id = %record.key_id(),
                master_key = %record.master_key(),
                "data key wrapped under an unregistered master key"
            );
            Error::Integrity
        })
    }
}

/// Store of wrapped data keys with a cache of unwrapped ones.
///
/// One instance is shared (by `Arc`) between every client that needs it;
/// independent instances share nothing, which keeps tests isolated.
///
/// # Example
///
/// ```ignore
/// use fledoc::key_vault::InMemoryKeyVault;
/// use fledoc::vault::DataKeyVault;
/// use fledoc_key_local::LocalKeyProvider;
///
/// let vault = DataKeyVault::new(LocalKeyProvider::generate()?, InMemoryKeyVault::new());
/// let key_id = vault.create_data_key(["example"])?;
/// let key = vault.get_data_key(&key_id)?;
/// ```
pub struct DataKeyVault {
    store: Arc<dyn KeyVaultStore>,
    providers: RwLock<Providers>,
    cache: RwLock<HashMap<KeyId, Arc<DataKey>>>,
    loading: Mutex<HashMap<KeyId, Arc<Mutex<()>>>>,
    editing: Mutex<HashMap<KeyId, Arc<Mutex<()>>>>,
}

enum Rewrap {
    Done,
    AlreadyCurrent,
    Deleted,
}

impl DataKeyVault {
    /// Creates a vault wrapping new keys with `provider` and persisting to `store`.
    pub fn new<P, S>(provider: P, store: S) -> Self
    where
        P: KeyWrapProvider + 'static,
        S: KeyVaultStore + 'static,
    {
        Self::from_shared(Arc::new(provider), Arc::new(store))
    }

    /// Creates a vault from already shared components.
    pub fn from_shared(provider: Arc<dyn KeyWrapProvider>, store: Arc<dyn KeyVaultStore>) -> Self {
        let mut by_master_key = HashMap::new();
        by_master_key.insert(provider.master_key(), Arc::clone(&provider));
        Self {
            store,
            providers: RwLock::new(Providers {
                active: provider,
                by_master_key,
            }),
            cache: RwLock::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
            editing: Mutex::new(HashMap::new()),
        }
    }

    /// Registers an additional provider able to unwrap keys under its master key.
    ///
    /// New keys are still wrapped by the active provider.
    pub fn register_provider(&self, provider: Arc<dyn KeyWrapProvider>) {
        let master_key = provider.master_key();
        debug!(master_key = %master_key, "registered key provider");
        self.providers.write().by_master_key.insert(master_key, provider);
    }

    /// Master key used for newly created data keys.
    #[must_use]
    pub fn active_master_key(&self) -> MasterKey {
        self.providers.read().active.master_key()
    }

    /// Creates and persists a new data key.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - An alt name is empty (`Error::InvalidSchema`)
    /// - An alt name is already taken (`Error::DuplicateAltName`)
    /// - The random source fails (`Error::Entropy`)
    /// - Wrapping or persisting fails
    pub fn create_data_key<I, N>(&self, alt_names: I) -> Result<KeyId>
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        let alt_names: BTreeSet<String> = alt_names.into_iter().map(Into::into).collect();
        if alt_names.iter().any(String::is_empty) {
            return Err(Error::InvalidSchema("key alt names must not be empty".into()));
        }
        for name in &alt_names {
            if self.store.find_by_alt_name(name)?.is_some() {
                return Err(Error::DuplicateAltName(name.clone()));
            }
        }

        let key = DataKey::generate()?;
        let provider = Arc::clone(&self.providers.read().active);
        let wrapped = provider.wrap_key(key.expose())?;

        let key_id = KeyId::new_v4();
        let record = DataKeyRecord::new(key_id, wrapped, alt_names, provider.master_key());
        self.store.insert(record).map_err(|e| match e {
            StoreError::DuplicateAltName(name) => Error::DuplicateAltName(name),
            other => Error::Store(other),
        })?;

        info!(key_id = %key_id, master_key = %provider.master_key(), "created data key");
        self.cache.write().insert(key_id, Arc::new(key));
        Ok(key_id)
    }

    /// Returns the unwrapped data key for `key_id`.
    ///
    /// Concurrent callers asking for the same uncached key share a single
    /// unwrap.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no record exists, or the provider's
    /// error (`Error::Integrity`, `Error::KeyProviderUnavailable`, ...) if
    /// unwrapping fails.
    pub fn get_data_key(&self, key_id: &KeyId) -> Result<Arc<DataKey>> {
        if let Some(key) = self.cache.read().get(key_id) {
            return Ok(Arc::clone(key));
        }

        let slot = Arc::clone(self.loading.lock().entry(*key_id).or_default());
        let result = {
            let _guard = slot.lock();
            // Another caller may have finished while we waited.
            let cached = self.cache.read().get(key_id).cloned();
            match cached {
                Some(key) => Ok(key),
                None => self.load_and_cache(key_id),
            }
        };

        let mut loading = self.loading.lock();
        drop(slot);
        if loading.get(key_id).is_some_and(|s| Arc::strong_count(s) == 1) {
            loading.remove(key_id);
        }
        drop(loading);

        result
    }

    fn load_and_cache(&self, key_id: &KeyId) -> Result<Arc<DataKey>> {
        let record = self.store.get(key_id)?.ok_or_else(|| Error::key_not_found(key_id))?;
        let provider = self.providers.read().for_record(&record)?;

        let material = provider.unwrap_key(record.wrapped_key()).map_err(|e| {
            warn!(
                key_id = %key_id,
                master_key = %record.master_key(),
                error = %e,
                "data key unwrap failed"
            );
            Error::from(e)
        })?;
        let key = Arc::new(DataKey::from_secret(material)?);

        debug!(key_id = %key_id, "cached data key");
        self.cache.write().insert(*key_id, Arc::clone(&key));
        Ok(key)
    }

    /// Resolves an alt name to its key id.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no key has this alt name.
    pub fn resolve_by_alt_name(&self, name: &str) -> Result<KeyId> {
        self.store
            .find_by_alt_name(name)?
            .map(|record| record.key_id())
            .ok_or_else(|| Error::KeyNotFound(format!("alt name '{name}'")))
    }

    /// Resolves a schema key reference to a key id.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if an alt name reference does not resolve.
    pub fn resolve(&self, key: &KeyRef) -> Result<KeyId> {
        match key {
            KeyRef::Id(id) => Ok(*id),
            KeyRef::AltName(name) => self.resolve_by_alt_name(name),
        }
    }

    /// Returns the stored record for `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if no record exists.
    pub fn get_key(&self, key_id: &KeyId) -> Result<DataKeyRecord> {
        self.store.get(key_id)?.ok_or_else(|| Error::key_not_found(key_id))
    }

    /// Lists all stored records.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails.
    pub fn list_keys(&self) -> Result<Vec<DataKeyRecord>> {
        Ok(self.store.list()?)
    }

    /// Adds an alt name to an existing key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` or `Error::DuplicateAltName`.
    pub fn add_key_alt_name(&self, key_id: &KeyId, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidSchema("key alt names must not be empty".into()));
        }
        self.with_record_locked(key_id, || {
            let mut record = self.get_key(key_id)?;
            if !record.insert_alt_name(name.to_string()) {
                return Ok(());
            }
            self.store.replace(record).map_err(|e| match e {
                StoreError::DuplicateAltName(name) => Error::DuplicateAltName(name),
                StoreError::NotFound(_) => Error::key_not_found(key_id),
                other => Error::Store(other),
            })
        })
    }

    /// Removes an alt name from a key. Removing an absent name is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the key does not exist.
    pub fn remove_key_alt_name(&self, key_id: &KeyId, name: &str) -> Result<()> {
        self.with_record_locked(key_id, || {
            let mut record = self.get_key(key_id)?;
            if record.remove_alt_name(name) {
                self.store.replace(record)?;
            }
            Ok(())
        })
    }

    /// Deletes a key and purges it from the cache.
    ///
    /// Documents still encrypted under it become unreadable.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyNotFound` if the key does not exist.
    pub fn delete_key(&self, key_id: &KeyId) -> Result<()> {
        self.with_record_locked(key_id, || {
            self.store.delete(key_id)?.ok_or_else(|| Error::key_not_found(key_id))
        })?;
        self.evict(key_id);
        warn!(key_id = %key_id, "deleted data key");
        Ok(())
    }

    /// Rewraps every data key under `new_provider`'s master key.
    ///
    /// Each record is rewritten on its own. A record that cannot be rewrapped
    /// stays under its old master key, whose provider remains registered, so
    /// every key stays readable whatever the outcome. The new provider becomes
    /// the active one.
    ///
    /// # Errors
    ///
    /// Returns error only if the store cannot list records; per-key failures
    /// are reported in [`RotationReport::failed`].
    pub fn rotate_master_key(
        &self,
        new_provider: Arc<dyn KeyWrapProvider>,
    ) -> Result<RotationReport> {
        let new_master = new_provider.master_key();
        self.register_provider(Arc::clone(&new_provider));

        let mut report = RotationReport::default();
        for record in self.store.list()? {
            let key_id = record.key_id();
            match self.rewrap(&key_id, new_provider.as_ref(), &new_master) {
                Ok(Rewrap::Done) => report.rotated.push(key_id),
                Ok(Rewrap::AlreadyCurrent) => report.unchanged.push(key_id),
                Ok(Rewrap::Deleted) => {}
                Err(e) => {
                    warn!(key_id = %key_id, error = %e, "data key kept under previous master key");
                    report.failed.push((key_id, e));
                }
            }
        }

        self.providers.write().active = new_provider;
        info!(
            master_key = %new_master,
            rotated = report.rotated.len(),
            failed = report.failed.len(),
            "master key rotation finished"
        );
        Ok(report)
    }

    /// Rewraps one record, re-read under its edit lock so concurrent alt-name
    /// changes are not overwritten.
    fn rewrap(
        &self,
        key_id: &KeyId,
        new_provider: &dyn KeyWrapProvider,
        new_master: &MasterKey,
    ) -> Result<Rewrap> {
        self.with_record_locked(key_id, || {
            let Some(record) = self.store.get(key_id)? else {
                return Ok(Rewrap::Deleted);
            };
            if record.master_key() == new_master {
                return Ok(Rewrap::AlreadyCurrent);
            }
            let old_provider = self.providers.read().for_record(&record)?;
            let material = old_provider.unwrap_key(record.wrapped_key())?;
            let key = DataKey::from_secret(material)?;
            let wrapped = new_provider.wrap_key(key.expose())?;
            self.store.replace(record.rewrapped(wrapped, new_master.clone()))?;
            Ok(Rewrap::Done)
        })
    }

    /// Runs a read-modify-write of one stored record, serialized per key id.
    fn with_record_locked<T>(&self, key_id: &KeyId, edit: impl FnOnce() -> Result<T>) -> Result<T> {
        let slot = Arc::clone(self.editing.lock().entry(*key_id).or_default());
        let result = {
            let _guard = slot.lock();
            edit()
        };

        let mut editing = self.editing.lock();
        drop(slot);
        if editing.get(key_id).is_some_and(|s| Arc::strong_count(s) == 1) {
            editing.remove(key_id);
        }
        drop(editing);

        result
    }

    /// Drops one key from the cache.
    pub fn evict(&self, key_id: &KeyId) {
        if self.cache.write().remove(key_id).is_some() {
            debug!(key_id = %key_id, "evicted data key");
        }
    }

    /// Drops every cached key.
    pub fn clear(&self) {
        let mut cache = self.cache.write();
        let count = cache.len();
        cache.clear();
        debug!(count, "cleared data key cache");
    }

    /// Number of keys currently held unwrapped.
    #[must_use]
    pub fn cached_key_count(&self) -> usize {
        self.cache.read().len()
    }
}
