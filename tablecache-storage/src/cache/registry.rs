//! Registry of all caches of a process.
//!
//! Built once at startup and passed by reference to whoever creates caches
//! or tears down connections. It owns the global enable switch; caches read
//! the switch without taking their own lock.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tablecache_core::{
    CacheConfig, CacheResult, ConfigError, ConnectionId, StorageError, TypeDescriptor,
};

use super::object_cache::ObjectCache;
use super::traits::{CacheStats, CachedObject, ManagedCache};
use crate::ObjectStore;

/// Shared on/off switch for every cache of a registry.
#[derive(Debug, Clone)]
pub struct CacheSwitch(Arc<AtomicBool>);

impl CacheSwitch {
    pub fn new(on: bool) -> Self {
        Self(Arc::new(AtomicBool::new(on)))
    }

    pub fn is_on(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, on: bool) {
        self.0.store(on, Ordering::Relaxed);
    }
}

impl Default for CacheSwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

struct RegisteredCache {
    managed: Arc<dyn ManagedCache>,
    typed: Arc<dyn Any + Send + Sync>,
}

/// All caches of a process, keyed by type name.
pub struct CacheRegistry {
    config: CacheConfig,
    switch: CacheSwitch,
    caches: RwLock<BTreeMap<String, RegisteredCache>>,
}

impl CacheRegistry {
    /// Create a registry whose caches start from `config`.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            switch: CacheSwitch::new(config.enabled),
            config,
            caches: RwLock::new(BTreeMap::new()),
        })
    }

    /// Create a registry configured from `TABLECACHE_*` environment variables.
    pub fn from_env() -> CacheResult<Self> {
        Self::new(CacheConfig::from_env()?)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn switch(&self) -> &CacheSwitch {
        &self.switch
    }

    /// Create and register the cache for `descriptor`.
    ///
    /// Fails with [`ConfigError::DuplicateCache`] if a cache with the same
    /// name is registered already.
    pub fn create_cache<T, S>(
        &self,
        descriptor: TypeDescriptor,
        store: Arc<S>,
        preloading: bool,
    ) -> CacheResult<Arc<ObjectCache<T, S>>>
    where
        T: CachedObject,
        S: ObjectStore<T> + 'static,
    {
        let mut caches = self.caches.write().map_err(|_| StorageError::LockPoisoned)?;
        if caches.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateCache {
                name: descriptor.name,
            }
            .into());
        }

        let name = descriptor.name.clone();
        let cache = Arc::new(ObjectCache::new(
            descriptor,
            store,
            preloading,
            &self.config,
            self.switch.clone(),
        )?);
        caches.insert(
            name.clone(),
            RegisteredCache {
                managed: cache.clone(),
                typed: cache.clone(),
            },
        );
        tracing::info!(cache = %name, preloading, "cache registered");
        Ok(cache)
    }

    /// Typed handle of the cache named `name`; `None` if there is no such
    /// cache or it holds a different type.
    pub fn cache<T, S>(&self, name: &str) -> CacheResult<Option<Arc<ObjectCache<T, S>>>>
    where
        T: CachedObject,
        S: ObjectStore<T> + 'static,
    {
        let caches = self.caches.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(caches
            .get(name)
            .and_then(|entry| entry.typed.clone().downcast::<ObjectCache<T, S>>().ok()))
    }

    /// Every registered cache, by name.
    pub fn caches(&self) -> CacheResult<Vec<Arc<dyn ManagedCache>>> {
        let caches = self.caches.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(caches.values().map(|entry| entry.managed.clone()).collect())
    }

    pub fn names(&self) -> CacheResult<Vec<String>> {
        let caches = self.caches.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(caches.keys().cloned().collect())
    }

    /// Turn every cache on or off. Turning them off also drops their
    /// contents so nothing stale survives until they are turned on again.
    pub fn set_all_enabled(&self, enabled: bool) -> CacheResult<()> {
        self.switch.set(enabled);
        if !enabled {
            self.invalidate_all()?;
        }
        tracing::info!(enabled, "global cache switch changed");
        Ok(())
    }

    pub fn all_enabled(&self) -> bool {
        self.switch.is_on()
    }

    pub fn invalidate_all(&self) -> CacheResult<()> {
        for cache in self.caches()? {
            cache.invalidate()?;
        }
        Ok(())
    }

    /// Drop everything loaded through `connection`, cache by cache.
    /// Returns the total number of objects removed.
    pub fn remove_for_connection(&self, connection: ConnectionId) -> CacheResult<usize> {
        let mut removed = 0;
        for cache in self.caches()? {
            removed += cache.remove_for_connection(connection)?;
        }
        tracing::debug!(connection = %connection, removed, "connection swept from caches");
        Ok(removed)
    }

    /// Statistics of every cache, by name.
    pub fn stats(&self) -> CacheResult<BTreeMap<String, CacheStats>> {
        let mut stats = BTreeMap::new();
        for cache in self.caches()? {
            stats.insert(cache.name().to_string(), cache.stats()?);
        }
        Ok(stats)
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("config", &self.config)
            .field("switch", &self.switch)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MockObjectStore, Restampable};
    use tablecache_core::{CacheError, ObjectId, ScopeKey, Serial, Session};

    #[derive(Debug, Clone)]
    struct Row {
        id: ObjectId,
        serial: Serial,
    }

    impl CachedObject for Row {
        fn object_id(&self) -> ObjectId {
            self.id
        }

        fn table_serial(&self) -> Serial {
            self.serial
        }

        fn scope(&self) -> ScopeKey {
            ScopeKey::global()
        }
    }

    impl Restampable for Row {
        fn restamp(&mut self, serial: Serial) {
            self.serial = serial;
        }
    }

    type RowCache = ObjectCache<Row, MockObjectStore<Row>>;

    fn registry() -> CacheRegistry {
        CacheRegistry::new(CacheConfig::default()).unwrap()
    }

    fn store() -> Arc<MockObjectStore<Row>> {
        let store = Arc::new(MockObjectStore::new());
        for id in 1..=3 {
            store.save(Row { id, serial: 0 }).unwrap();
        }
        store
    }

    #[test]
    fn test_duplicate_cache_rejected() {
        let registry = registry();
        registry
            .create_cache::<Row, _>(TypeDescriptor::new("row", "rows"), store(), false)
            .unwrap();
        let err = registry
            .create_cache::<Row, _>(TypeDescriptor::new("row", "rows"), store(), false)
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Config(ConfigError::DuplicateCache { ref name }) if name == "row"
        ));
    }

    #[test]
    fn test_typed_lookup() {
        let registry = registry();
        let created = registry
            .create_cache::<Row, _>(TypeDescriptor::new("row", "rows"), store(), false)
            .unwrap();

        let found: Arc<RowCache> = registry.cache("row").unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert!(registry.cache::<Row, MockObjectStore<Row>>("missing").unwrap().is_none());
        assert_eq!(registry.names().unwrap(), vec!["row".to_string()]);
    }

    #[test]
    fn test_remove_for_connection_sweeps_all_caches() {
        let registry = registry();
        let a = registry
            .create_cache::<Row, _>(TypeDescriptor::new("a", "a"), store(), false)
            .unwrap();
        let b = registry
            .create_cache::<Row, _>(TypeDescriptor::new("b", "b"), store(), false)
            .unwrap();
        let closing = Session::new(ConnectionId::now_v7());
        let staying = Session::new(ConnectionId::now_v7());
        let global = ScopeKey::global();

        a.select_by_id(&closing, &global, 1, true).unwrap();
        a.select_by_id(&staying, &global, 2, true).unwrap();
        b.select_by_id(&closing, &global, 3, true).unwrap();

        assert_eq!(registry.remove_for_connection(closing.connection).unwrap(), 2);
        assert_eq!(a.cached_ids().unwrap(), vec![2]);
        assert!(b.cached_ids().unwrap().is_empty());
    }

    #[test]
    fn test_global_switch_disables_and_clears() {
        let registry = registry();
        let cache = registry
            .create_cache::<Row, _>(TypeDescriptor::new("row", "rows"), store(), false)
            .unwrap();
        let session = Session::new(ConnectionId::now_v7());
        cache
            .select_by_id(&session, &ScopeKey::global(), 1, true)
            .unwrap();

        registry.set_all_enabled(false).unwrap();
        assert!(!registry.all_enabled());
        assert!(!cache.is_active());
        assert_eq!(cache.size().unwrap(), 0);

        cache
            .select_by_id(&session, &ScopeKey::global(), 1, true)
            .unwrap();
        assert_eq!(cache.size().unwrap(), 0);

        registry.set_all_enabled(true).unwrap();
        cache
            .select_by_id(&session, &ScopeKey::global(), 1, true)
            .unwrap();
        assert_eq!(cache.size().unwrap(), 1);
    }

    #[test]
    fn test_stats_by_name() {
        let registry = registry();
        registry
            .create_cache::<Row, _>(TypeDescriptor::new("row", "rows"), store(), false)
            .unwrap();
        let stats = registry.stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats["row"].entry_count, 0);
    }
}
