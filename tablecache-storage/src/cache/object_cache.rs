//! The per-type object cache.
//!
//! One [`ObjectCache`] holds the cached rows of one domain type: a permanent
//! id index, any number of attached secondary indexes, per-scope context
//! lists and the serial watermarks of the expiration protocol. All state is
//! guarded by a single mutex; storage is called while the lock is held.
//!
//! Every mutating path runs through a bounded retry loop: a unique
//! violation or key change invalidates the whole cache and retries the
//! call, a storage failure invalidates the cache and is returned to the
//! caller unchanged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tablecache_core::{
    validate_keep_quota, CacheConfig, CacheError, CacheResult, ConnectionId, EvictionStrategy,
    IndexError, ObjectId, ScopeKey, Serial, SerialChange, Session, StorageError, TypeDescriptor,
};

use super::context_list::ContextList;
use super::eviction::{AccessStats, EvictionPolicy, ShrinkPlan};
use super::expiration::{analyze_changes, ChangeAnalysis, ExpirationOutcome, SerialWatermarks};
use super::index::{id_violation, typed_table, ErasedIndex, IndexSpec, IndexTable, ID_INDEX};
use super::registry::CacheSwitch;
use super::traits::{CacheStats, CachedObject, ManagedCache};
use crate::ObjectStore;

/// Deferred expiration ceiling meaning "up to now".
const DEFERRED_TO_NOW: Serial = Serial::MAX;

/// Bookkeeping the cache keeps per indexed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    /// Number of hits since the object was cached.
    pub access_count: u64,
    /// Logical time of the last hit, or of insertion.
    pub access_tick: u64,
    /// Connection the object was loaded or added through.
    pub connection: ConnectionId,
    pub cached_at: DateTime<Utc>,
}

struct Entry<T> {
    object: Arc<T>,
    meta: EntryMeta,
}

struct CacheState<T> {
    entries: BTreeMap<ObjectId, Entry<T>>,
    indexes: Vec<Box<dyn ErasedIndex<T>>>,
    lists: HashMap<ScopeKey, ContextList<T>>,
    /// Scopes whose full population is cached, with the loading connection.
    preloaded: HashMap<ScopeKey, ConnectionId>,
    serials: SerialWatermarks,
    policy: EvictionPolicy,
    clock: u64,
    stats: CacheStats,
}

impl<T: CachedObject> CacheState<T> {
    fn new(policy: EvictionPolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            indexes: Vec::new(),
            lists: HashMap::new(),
            preloaded: HashMap::new(),
            serials: SerialWatermarks::new(),
            policy,
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn invalidate(&mut self) {
        self.clear_objects();
        self.serials.reset();
        self.stats.invalidations += 1;
    }

    /// Empty the indexes and lists. Serial watermarks, including a pending
    /// deferred expiration, are left alone.
    fn clear_objects(&mut self) {
        self.entries.clear();
        for index in &mut self.indexes {
            index.clear();
        }
        self.drop_lists();
    }

    fn drop_lists(&mut self) {
        self.lists.clear();
        self.preloaded.clear();
    }

    /// A miss in `scope` is final only while the scope's preloaded list is
    /// complete. Expired slots awaiting a rescan may hide newer rows.
    fn answers_misses(&self, scope: &ScopeKey) -> bool {
        self.preloaded.contains_key(scope)
            && self
                .lists
                .get(scope)
                .is_some_and(|list| !list.is_pending_rescan())
    }

    /// Index `object`. In strict mode an already cached id is a unique
    /// violation; otherwise the fresher of both copies wins and is returned.
    fn insert(
        &mut self,
        object: Arc<T>,
        connection: ConnectionId,
        strict: bool,
    ) -> CacheResult<Arc<T>> {
        let id = object.object_id();
        if let Some(existing) = self.entries.get(&id) {
            if strict {
                return Err(id_violation(id).into());
            }
            if existing.object.table_serial() >= object.table_serial() {
                return Ok(Arc::clone(&existing.object));
            }
            self.remove_entry(id)?;
        }
        let meta = EntryMeta {
            access_count: 0,
            access_tick: self.next_tick(),
            connection,
            cached_at: Utc::now(),
        };
        self.insert_entry(Entry {
            object: Arc::clone(&object),
            meta,
        })?;
        Ok(object)
    }

    /// Add `entry` to every index, rolling back on the first collision.
    fn insert_entry(&mut self, entry: Entry<T>) -> CacheResult<()> {
        let id = entry.object.object_id();
        if self.entries.contains_key(&id) {
            return Err(id_violation(id).into());
        }
        for i in 0..self.indexes.len() {
            if !self.indexes[i].add(&entry.object) {
                let violation = self.indexes[i].violation(&entry.object);
                for index in &mut self.indexes[..i] {
                    index.remove(&entry.object)?;
                }
                return Err(violation.into());
            }
        }
        self.serials.raise_table_serial(entry.object.table_serial());
        self.entries.insert(id, entry);
        Ok(())
    }

    /// Drop the object with `id` from every index.
    fn remove_entry(&mut self, id: ObjectId) -> CacheResult<Option<Arc<T>>> {
        let Some(entry) = self.entries.remove(&id) else {
            return Ok(None);
        };
        for index in &mut self.indexes {
            if !index.remove(&entry.object)? {
                return Err(IndexError::KeyChanged {
                    index: index.name().to_string(),
                    id,
                }
                .into());
            }
        }
        Ok(Some(entry.object))
    }

    /// Record a hit on `id`.
    fn touch(&mut self, id: ObjectId) -> Option<Arc<T>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(&id)?;
        entry.meta.access_count += 1;
        entry.meta.access_tick = tick;
        Some(Arc::clone(&entry.object))
    }

    fn population(&self) -> Vec<AccessStats> {
        self.entries
            .iter()
            .map(|(&id, entry)| AccessStats {
                id,
                access_count: entry.meta.access_count,
                access_tick: entry.meta.access_tick,
            })
            .collect()
    }

    /// Attach the index described by `spec` unless it is attached already,
    /// backfilling it from the current population. Returns true if the
    /// backfill hit a duplicate key and the cache was invalidated instead.
    fn ensure_index<I: IndexSpec<T>>(&mut self, spec: &Arc<I>) -> CacheResult<bool> {
        let name = spec.name();
        if name == ID_INDEX {
            return Err(IndexError::PermanentIndex {
                index: ID_INDEX.to_string(),
            }
            .into());
        }
        if typed_table::<T, I>(&self.indexes, name).is_some() {
            return Ok(false);
        }
        // Same name, different spec type: the new definition replaces it.
        self.indexes.retain(|index| index.name() != name);

        let mut table = IndexTable::new(Arc::clone(spec));
        let mut conflict = false;
        for entry in self.entries.values() {
            if table.add_unique(&entry.object).is_err() {
                conflict = true;
                break;
            }
        }
        if conflict {
            self.invalidate();
            table = IndexTable::new(Arc::clone(spec));
        }
        self.indexes.push(Box::new(table));
        Ok(conflict)
    }

    fn lists_have_equal_size(&self) -> bool {
        let mut sizes = self.lists.values().map(ContextList::len);
        match sizes.next() {
            Some(first) => sizes.all(|size| size == first),
            None => true,
        }
    }
}

/// Cache for the objects of one domain type.
pub struct ObjectCache<T, S> {
    descriptor: TypeDescriptor,
    store: Arc<S>,
    preloading: bool,
    enabled: AtomicBool,
    switch: CacheSwitch,
    max_conflict_retries: u32,
    state: Mutex<CacheState<T>>,
}

impl<T, S> ObjectCache<T, S>
where
    T: CachedObject,
    S: ObjectStore<T> + 'static,
{
    /// Create a cache loading through `store`.
    ///
    /// A `preloading` cache loads the whole population of a scope on its
    /// first use and answers later misses in that scope without storage.
    pub fn new(
        descriptor: TypeDescriptor,
        store: Arc<S>,
        preloading: bool,
        config: &CacheConfig,
        switch: CacheSwitch,
    ) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            descriptor,
            store,
            preloading,
            enabled: AtomicBool::new(config.enabled),
            switch,
            max_conflict_retries: config.max_conflict_retries,
            state: Mutex::new(CacheState::new(EvictionPolicy::new(
                config.max_size,
                config.strategy,
                config.keep_quota,
            ))),
        })
    }

    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn is_preloading(&self) -> bool {
        self.preloading
    }

    /// Enabled locally and globally.
    pub fn is_active(&self) -> bool {
        self.switch.is_on() && self.enabled.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Look up the object whose `index` key is `key`.
    ///
    /// On a miss the object is loaded through the index, unless `load` is
    /// false or the scope is preloaded and its list has no expired slots. A loaded cacheable object is
    /// indexed before it is returned.
    pub fn select<I: IndexSpec<T>>(
        &self,
        index: &Arc<I>,
        session: &Session,
        scope: &ScopeKey,
        key: &I::Key,
        load: bool,
    ) -> CacheResult<Option<Arc<T>>> {
        if !self.is_active() {
            return Ok(index.load(session, scope, key)?.map(Arc::new));
        }
        self.run("select", |state| {
            self.attach(state, index)?;
            self.prepare(state, session, scope)?;

            let hit = typed_table::<T, I>(&state.indexes, index.name())
                .and_then(|table| table.get(key))
                .map(|object| object.object_id());
            if let Some(id) = hit {
                state.stats.hits += 1;
                return Ok(state.touch(id));
            }
            state.stats.misses += 1;
            if !load || state.answers_misses(scope) {
                return Ok(None);
            }

            let loaded = index.load(session, scope, key)?;
            self.cache_loaded(state, session, loaded)
        })
    }

    /// Look up an object through the permanent id index.
    pub fn select_by_id(
        &self,
        session: &Session,
        scope: &ScopeKey,
        id: ObjectId,
        load: bool,
    ) -> CacheResult<Option<Arc<T>>> {
        if !self.is_active() {
            return Ok(self.store.load_by_id(session, scope, id)?.map(Arc::new));
        }
        self.run("select_by_id", |state| {
            self.prepare(state, session, scope)?;

            if state.entries.contains_key(&id) {
                state.stats.hits += 1;
                return Ok(state.touch(id));
            }
            state.stats.misses += 1;
            if !load || state.answers_misses(scope) {
                return Ok(None);
            }

            let loaded = self.store.load_by_id(session, scope, id)?;
            self.cache_loaded(state, session, loaded)
        })
    }

    /// Cached objects of `scope` with `from <= key <= to`, in key order.
    ///
    /// Only cached objects are considered; on a preloading cache this is
    /// the complete answer once the scope is preloaded.
    pub fn select_range<I: IndexSpec<T>>(
        &self,
        index: &Arc<I>,
        session: &Session,
        scope: &ScopeKey,
        from: &I::Key,
        to: &I::Key,
    ) -> CacheResult<Vec<Arc<T>>> {
        if !self.is_active() {
            return Ok(Vec::new());
        }
        self.run("select_range", |state| {
            self.attach(state, index)?;
            self.prepare(state, session, scope)?;

            let objects = typed_table::<T, I>(&state.indexes, index.name())
                .map(|table| table.range(from, to))
                .unwrap_or_default();
            Ok(objects
                .into_iter()
                .filter(|object| object.scope() == *scope)
                .collect())
        })
    }

    /// Every object of `scope`, served from the scope's context list.
    ///
    /// A missing list is loaded and cached, except inside a transaction
    /// where the rows are returned without caching the list. A list marked
    /// for rescan has its expired slots reloaded first.
    pub fn select_all_in_context(
        &self,
        session: &Session,
        scope: &ScopeKey,
    ) -> CacheResult<Vec<Arc<T>>> {
        if !self.is_active() {
            return Ok(self
                .store
                .load_all(session, scope)?
                .into_iter()
                .map(Arc::new)
                .collect());
        }
        self.run("select_all", |state| {
            self.prepare(state, session, scope)?;

            match state.lists.get(scope).map(ContextList::is_pending_rescan) {
                Some(false) => {}
                Some(true) => self.rescan_list(state, session, scope)?,
                None if session.in_transaction => {
                    let rows = self.store.load_all(session, scope)?;
                    state.stats.loads += rows.len() as u64;
                    return Ok(rows.into_iter().map(Arc::new).collect());
                }
                None => self.load_list(state, session, scope)?,
            }
            Ok(state
                .lists
                .get(scope)
                .map(ContextList::snapshot)
                .unwrap_or_default())
        })
    }

    // ------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------

    /// Cache `object` after the caller persisted it. An already cached copy
    /// is replaced. Returns false when the object was not cached.
    pub fn add(&self, session: &Session, object: T) -> CacheResult<bool> {
        if !self.is_active() || !object.is_cacheable() {
            return Ok(false);
        }
        let object = Arc::new(object);
        let id = object.object_id();
        let scope = object.scope();
        self.run("add", |state| {
            state.remove_entry(id)?;
            state.insert(Arc::clone(&object), session.connection, true)?;
            for (list_scope, list) in state.lists.iter_mut() {
                if *list_scope == scope {
                    list.upsert(Arc::clone(&object));
                } else {
                    list.remove(id);
                }
            }
            if state.policy.needs_shrink(state.entries.len()) {
                self.shrink_locked(state)?;
            }
            Ok(true)
        })
    }

    /// Drop `object` from every index and context list.
    /// Returns whether it was cached.
    pub fn remove(&self, object: &T) -> CacheResult<bool> {
        let id = object.object_id();
        self.run("remove", |state| {
            let removed = state.remove_entry(id)?.is_some();
            let mut listed = false;
            for list in state.lists.values_mut() {
                listed |= list.remove(id);
            }
            Ok(removed || listed)
        })
    }

    /// Drop all objects, lists and preloaded marks.
    pub fn invalidate(&self) -> CacheResult<()> {
        let mut state = self.lock()?;
        state.invalidate();
        tracing::debug!(cache = %self.descriptor.name, "cache invalidated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expiration
    // ------------------------------------------------------------------

    /// Expire every object saved since the last scan, up to `max_serial`
    /// (0 meaning "up to now").
    ///
    /// Without a session the scan is deferred to the next lookup. A second
    /// deferral while one is pending is ignored.
    pub fn expire(
        &self,
        session: Option<&Session>,
        max_serial: Serial,
    ) -> CacheResult<ExpirationOutcome> {
        let Some(session) = session else {
            let mut state = self.lock()?;
            if state.serials.has_pending_expiration() {
                tracing::debug!(
                    cache = %self.descriptor.name,
                    pending = state.serials.expired_table_serial,
                    "deferred expiration already pending"
                );
            } else {
                state.serials.expired_table_serial =
                    if max_serial > 0 { max_serial } else { DEFERRED_TO_NOW };
            }
            return Ok(ExpirationOutcome::Deferred);
        };

        self.run("expire", |state| {
            let ceiling = take_pending_ceiling(state, max_serial);
            self.expire_locked(state, session, ceiling)
        })
    }

    /// Apply a change notification: `changes` are the (id, serial) pairs
    /// saved since the last scan, `current_serial` is the table serial at
    /// the time the notification was produced.
    pub fn expire_by_expiration_info(
        &self,
        changes: &[SerialChange],
        current_serial: Option<Serial>,
    ) -> CacheResult<ExpirationOutcome> {
        self.run("expire", |state| {
            self.apply_expiration(state, changes, current_serial)
        })
    }

    // ------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------

    /// Run one eviction pass according to the configured strategy.
    pub fn shrink_cache(&self) -> CacheResult<()> {
        self.run("shrink", |state| self.shrink_locked(state))
    }

    pub fn set_max_size(&self, max_size: usize) -> CacheResult<()> {
        self.lock()?.policy.max_size = max_size;
        Ok(())
    }

    pub fn set_strategy(&self, strategy: EvictionStrategy) -> CacheResult<()> {
        self.lock()?.policy.strategy = strategy;
        Ok(())
    }

    pub fn set_keep_quota(&self, keep_quota: u32) -> CacheResult<()> {
        validate_keep_quota(keep_quota)?;
        self.lock()?.policy.keep_quota = keep_quota;
        Ok(())
    }

    pub fn policy(&self) -> CacheResult<EvictionPolicy> {
        Ok(self.lock()?.policy)
    }

    // ------------------------------------------------------------------
    // Indexes
    // ------------------------------------------------------------------

    /// Attach the index described by `spec`, backfilled from the current
    /// population. A backfill collision invalidates the cache.
    pub fn attach_index<I: IndexSpec<T>>(&self, spec: &Arc<I>) -> CacheResult<()> {
        self.run("attach_index", |state| self.attach(state, spec))
    }

    /// Detach the index named `name`. Returns whether it was attached.
    pub fn detach_index(&self, name: &str) -> CacheResult<bool> {
        if name == ID_INDEX {
            return Err(IndexError::PermanentIndex {
                index: ID_INDEX.to_string(),
            }
            .into());
        }
        let mut state = self.lock()?;
        let before = state.indexes.len();
        state.indexes.retain(|index| index.name() != name);
        Ok(state.indexes.len() != before)
    }

    /// Names of all indexes, the id index first.
    pub fn index_names(&self) -> CacheResult<Vec<String>> {
        let state = self.lock()?;
        Ok(std::iter::once(ID_INDEX.to_string())
            .chain(state.indexes.iter().map(|index| index.name().to_string()))
            .collect())
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn watermarks(&self) -> CacheResult<SerialWatermarks> {
        Ok(self.lock()?.serials.clone())
    }

    pub fn table_serial(&self) -> CacheResult<Serial> {
        Ok(self.lock()?.serials.table_serial)
    }

    pub fn min_table_serial(&self) -> CacheResult<Serial> {
        Ok(self.lock()?.serials.min_table_serial)
    }

    pub fn is_preloaded(&self, scope: &ScopeKey) -> CacheResult<bool> {
        Ok(self.lock()?.preloaded.contains_key(scope))
    }

    pub fn has_list(&self, scope: &ScopeKey) -> CacheResult<bool> {
        Ok(self.lock()?.lists.contains_key(scope))
    }

    /// Access bookkeeping of a cached object.
    pub fn entry_meta(&self, id: ObjectId) -> CacheResult<Option<EntryMeta>> {
        Ok(self.lock()?.entries.get(&id).map(|entry| entry.meta))
    }

    /// Ids of all cached objects, ascending.
    pub fn cached_ids(&self) -> CacheResult<Vec<ObjectId>> {
        Ok(self.lock()?.entries.keys().copied().collect())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> CacheResult<MutexGuard<'_, CacheState<T>>> {
        self.state
            .lock()
            .map_err(|_| CacheError::from(StorageError::LockPoisoned))
    }

    /// Run `f` under the cache lock, invalidating and retrying on index
    /// conflicts. Storage errors invalidate the cache and are returned.
    fn run<R>(
        &self,
        operation: &'static str,
        mut f: impl FnMut(&mut CacheState<T>) -> CacheResult<R>,
    ) -> CacheResult<R> {
        let attempts = self.max_conflict_retries + 1;
        for attempt in 1..=attempts {
            let mut state = self.lock()?;
            match f(&mut *state) {
                Err(err) if err.is_conflict() => {
                    tracing::warn!(
                        cache = %self.descriptor.name,
                        operation,
                        attempt,
                        error = %err,
                        "index conflict, invalidating cache"
                    );
                    state.stats.conflicts += 1;
                    state.invalidate();
                }
                Err(err) if err.is_storage() => {
                    tracing::error!(
                        cache = %self.descriptor.name,
                        operation,
                        error = %err,
                        "storage failure, invalidating cache"
                    );
                    state.invalidate();
                    return Err(err);
                }
                other => return other,
            }
        }
        Err(CacheError::ConflictRetriesExhausted {
            cache: self.descriptor.name.clone(),
            operation,
            attempts,
        })
    }

    fn attach<I: IndexSpec<T>>(&self, state: &mut CacheState<T>, spec: &Arc<I>) -> CacheResult<()> {
        if state.ensure_index(spec)? {
            tracing::warn!(
                cache = %self.descriptor.name,
                index = spec.name(),
                "duplicate key while attaching index, cache invalidated"
            );
        }
        Ok(())
    }

    /// Work every lookup does before touching the indexes: fetch the
    /// initial serial, run a deferred expiration, shrink an oversized
    /// cache and preload the scope.
    fn prepare(
        &self,
        state: &mut CacheState<T>,
        session: &Session,
        scope: &ScopeKey,
    ) -> CacheResult<()> {
        if !state.serials.is_min_set() {
            let current = self.store.query_current_serial(session, scope)?;
            // Objects added before the first lookup may predate `current`.
            let floor = if state.entries.is_empty() {
                current
            } else {
                current.min(state.serials.table_serial)
            };
            state.serials.raise_min(floor);
            state.serials.raise_max(current);
        }

        if state.serials.has_pending_expiration() {
            let ceiling = take_pending_ceiling(state, 0);
            self.expire_locked(state, session, ceiling)?;
        }

        if state.policy.needs_shrink(state.entries.len()) {
            self.shrink_locked(state)?;
        }

        if self.preloading && !session.in_transaction && !state.preloaded.contains_key(scope) {
            self.load_list(state, session, scope)?;
        }
        Ok(())
    }

    /// Index a freshly loaded row and record the hit.
    fn cache_loaded(
        &self,
        state: &mut CacheState<T>,
        session: &Session,
        loaded: Option<T>,
    ) -> CacheResult<Option<Arc<T>>> {
        let Some(row) = loaded else {
            return Ok(None);
        };
        state.stats.loads += 1;
        let object = Arc::new(row);
        if !object.is_cacheable() {
            return Ok(Some(object));
        }
        let id = object.object_id();
        state.insert(object, session.connection, true)?;
        Ok(state.touch(id))
    }

    /// Load and cache the context list of `scope`.
    fn load_list(
        &self,
        state: &mut CacheState<T>,
        session: &Session,
        scope: &ScopeKey,
    ) -> CacheResult<()> {
        let rows = self.store.load_all(session, scope)?;
        state.stats.loads += rows.len() as u64;

        let mut objects = Vec::with_capacity(rows.len());
        for row in rows.into_iter().filter(|row| row.is_cacheable()) {
            objects.push(state.insert(Arc::new(row), session.connection, false)?);
        }
        tracing::debug!(
            cache = %self.descriptor.name,
            scope = %scope,
            objects = objects.len(),
            "context list loaded"
        );
        state
            .lists
            .insert(*scope, ContextList::new(session.connection, objects));
        if self.preloading {
            state.preloaded.insert(*scope, session.connection);
        }
        Ok(())
    }

    /// Reload the expired slots of the list of `scope`.
    fn rescan_list(
        &self,
        state: &mut CacheState<T>,
        session: &Session,
        scope: &ScopeKey,
    ) -> CacheResult<()> {
        let expired = state
            .lists
            .get(scope)
            .map(ContextList::expired_ids)
            .unwrap_or_default();

        for id in expired {
            let refreshed = match self.store.load_by_id(session, scope, id)? {
                Some(row) => {
                    state.stats.loads += 1;
                    let object = Arc::new(row);
                    if object.is_cacheable() {
                        Some(state.insert(object, session.connection, false)?)
                    } else {
                        Some(object)
                    }
                }
                None => None,
            };
            if let Some(list) = state.lists.get_mut(scope) {
                list.repair(id, refreshed);
            }
        }
        if let Some(list) = state.lists.get_mut(scope) {
            list.finish_rescan();
        }
        Ok(())
    }

    fn expire_locked(
        &self,
        state: &mut CacheState<T>,
        session: &Session,
        max_serial: Serial,
    ) -> CacheResult<ExpirationOutcome> {
        let floor = state.serials.scan_floor();
        if max_serial > 0 && max_serial <= floor {
            return Ok(ExpirationOutcome::Unchanged);
        }
        let changes = self.store.query_changed_serials(session, floor, max_serial)?;
        let ceiling = (max_serial > 0).then_some(max_serial);
        self.apply_expiration(state, &changes, ceiling)
    }

    fn apply_expiration(
        &self,
        state: &mut CacheState<T>,
        changes: &[SerialChange],
        ceiling: Option<Serial>,
    ) -> CacheResult<ExpirationOutcome> {
        let floor = state.serials.scan_floor();
        if let Some(ceiling) = ceiling {
            state.serials.raise_min(ceiling);
        }

        let (ids, highest) = match analyze_changes(changes, floor, ceiling) {
            ChangeAnalysis::Gap { after } => {
                tracing::warn!(
                    cache = %self.descriptor.name,
                    after,
                    ceiling = ?ceiling,
                    "serial gap detected, invalidating cache"
                );
                state.invalidate();
                // Everything up to the scanned serials is accounted for now.
                if let Some(last) = changes.iter().map(|change| change.serial).max() {
                    state.serials.raise_min(last);
                }
                return Ok(ExpirationOutcome::Invalidated);
            }
            ChangeAnalysis::Changed { ids, highest } => (ids, highest),
        };
        state.serials.raise_min(highest);
        if ids.is_empty() {
            return Ok(ExpirationOutcome::Unchanged);
        }

        let (found, expired) = expire_stale(state, &ids)?;
        state.stats.expirations += expired.len() as u64;
        tracing::debug!(
            cache = %self.descriptor.name,
            changed = ids.len(),
            found,
            expired = expired.len(),
            "objects expired"
        );

        if found < ids.len() {
            // Rows we never cached changed: lists may be missing them.
            if self.preloading {
                state.invalidate();
                return Ok(ExpirationOutcome::Invalidated);
            }
            state.drop_lists();
            return Ok(ExpirationOutcome::Expired {
                expired: expired.len(),
                lists_kept: false,
            });
        }
        if expired.is_empty() {
            return Ok(ExpirationOutcome::Unchanged);
        }

        let lists_kept = state.lists_have_equal_size();
        if lists_kept {
            for list in state.lists.values_mut() {
                list.mark_expired(&expired);
            }
        } else {
            state.drop_lists();
        }
        Ok(ExpirationOutcome::Expired {
            expired: expired.len(),
            lists_kept,
        })
    }

    fn shrink_locked(&self, state: &mut CacheState<T>) -> CacheResult<()> {
        let before = state.entries.len();
        match state.policy.plan(&state.population()) {
            ShrinkPlan::InvalidateAll => state.invalidate(),
            ShrinkPlan::RemoveColdest(victims) => {
                for id in victims {
                    state.remove_entry(id)?;
                }
                state.drop_lists();
            }
            ShrinkPlan::KeepWarmest(keep) => {
                let survivors: Vec<Entry<T>> = keep
                    .iter()
                    .filter_map(|id| state.entries.remove(id))
                    .collect();
                state.clear_objects();
                for entry in survivors {
                    state.insert_entry(entry)?;
                }
            }
        }
        let evicted = before.saturating_sub(state.entries.len());
        state.stats.evictions += evicted as u64;
        tracing::debug!(
            cache = %self.descriptor.name,
            strategy = %state.policy.strategy,
            before,
            after = state.entries.len(),
            "cache shrunk"
        );
        Ok(())
    }
}

/// Combine a requested ceiling with a pending deferred one and clear it.
fn take_pending_ceiling<T: CachedObject>(state: &mut CacheState<T>, max_serial: Serial) -> Serial {
    let pending = std::mem::take(&mut state.serials.expired_table_serial);
    match (pending, max_serial) {
        (0, requested) => requested,
        (DEFERRED_TO_NOW, _) | (_, 0) => 0,
        (pending, requested) => pending.max(requested),
    }
}

/// Remove every cached object older than its reported serial from the
/// indexes. Returns how many changed ids were cached at all, and the ids
/// actually removed.
fn expire_stale<T: CachedObject>(
    state: &mut CacheState<T>,
    changes: &BTreeMap<ObjectId, Serial>,
) -> CacheResult<(usize, BTreeSet<ObjectId>)> {
    let mut found = 0;
    let mut expired = BTreeSet::new();
    for (&id, &serial) in changes {
        let Some(entry) = state.entries.get(&id) else {
            continue;
        };
        found += 1;
        if entry.object.table_serial() < serial {
            state.remove_entry(id)?;
            expired.insert(id);
        }
    }
    Ok((found, expired))
}

impl<T, S> ManagedCache for ObjectCache<T, S>
where
    T: CachedObject,
    S: ObjectStore<T> + 'static,
{
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn size(&self) -> CacheResult<usize> {
        Ok(self.lock()?.entries.len())
    }

    fn invalidate(&self) -> CacheResult<()> {
        ObjectCache::invalidate(self)
    }

    fn remove_for_connection(&self, connection: ConnectionId) -> CacheResult<usize> {
        self.run("remove_for_connection", |state| {
            let owned: Vec<ObjectId> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.meta.connection == connection)
                .map(|(&id, _)| id)
                .collect();
            for &id in &owned {
                state.remove_entry(id)?;
            }
            state.lists.retain(|_, list| list.connection() != connection);
            let lists = &state.lists;
            state
                .preloaded
                .retain(|scope, loaded_by| *loaded_by != connection && lists.contains_key(scope));
            Ok(owned.len())
        })
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        let state = self.lock()?;
        Ok(CacheStats {
            entry_count: state.entries.len() as u64,
            list_count: state.lists.len() as u64,
            ..state.stats.clone()
        })
    }

    fn set_enabled(&self, enabled: bool) {
        let was = self.enabled.swap(enabled, Ordering::SeqCst);
        if was && !enabled {
            if let Err(err) = ObjectCache::invalidate(self) {
                tracing::warn!(cache = %self.descriptor.name, error = %err, "invalidate on disable failed");
            }
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

impl<T, S> std::fmt::Debug for ObjectCache<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("descriptor", &self.descriptor)
            .field("preloading", &self.preloading)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}
