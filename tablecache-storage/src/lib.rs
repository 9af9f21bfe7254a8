//! tablecache Storage - Object Cache and Storage Collaborator
//!
//! Defines the storage abstraction the cache loads through, an in-memory
//! mock of it, and the cache itself (see [`cache`]).

pub mod cache;

pub use cache::{
    analyze_changes, AccessStats, CacheRegistry, CacheStats, CacheSwitch, CachedObject,
    ChangeAnalysis, ContextList, EntryMeta, ErasedIndex, EvictionPolicy, ExpirationOutcome,
    IndexSpec, IndexTable, ManagedCache, ObjectCache, SerialWatermarks, ShrinkPlan, ID_INDEX,
    UNSET_SERIAL,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use tablecache_core::{
    CacheResult, ObjectId, ScopeKey, Serial, SerialChange, Session, StorageError,
};

// ============================================================================
// STORAGE TRAIT
// ============================================================================

/// Storage operations a cache needs from the persistence layer.
///
/// All calls run on the caller's [`Session`]. Implementations must be
/// callable while the cache holds its own lock and must never call back
/// into the cache.
pub trait ObjectStore<T>: Send + Sync {
    /// Load one row by id.
    fn load_by_id(
        &self,
        session: &Session,
        scope: &ScopeKey,
        id: ObjectId,
    ) -> CacheResult<Option<T>>;

    /// Load every row of `scope`, in a stable order.
    fn load_all(&self, session: &Session, scope: &ScopeKey) -> CacheResult<Vec<T>>;

    /// Every row saved with a serial in `(since, upto]`, sorted by serial.
    /// `upto == 0` means "up to now".
    fn query_changed_serials(
        &self,
        session: &Session,
        since: Serial,
        upto: Serial,
    ) -> CacheResult<Vec<SerialChange>>;

    /// Current value of the table serial.
    fn query_current_serial(&self, session: &Session, scope: &ScopeKey) -> CacheResult<Serial>;
}

/// Rows whose saved serial the mock store can restamp.
pub trait Restampable: CachedObject + Clone {
    fn restamp(&mut self, serial: Serial);
}

// ============================================================================
// MOCK STORAGE
// ============================================================================

#[derive(Debug)]
struct MockTable<T> {
    rows: BTreeMap<ObjectId, T>,
    serial: Serial,
}

impl<T> Default for MockTable<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            serial: 0,
        }
    }
}

/// In-memory table with a serial counter, for testing.
///
/// Every save stamps the row with the next table serial. A delete consumes
/// a serial as well, so deletions show up as gaps in a changed-serials
/// scan exactly like they do against a real table.
#[derive(Debug)]
pub struct MockObjectStore<T> {
    table: RwLock<MockTable<T>>,
    failure: Mutex<Option<StorageError>>,
    load_all_calls: AtomicUsize,
    load_by_id_calls: AtomicUsize,
    serial_queries: AtomicUsize,
}

impl<T> Default for MockObjectStore<T> {
    fn default() -> Self {
        Self {
            table: RwLock::new(MockTable::default()),
            failure: Mutex::new(None),
            load_all_calls: AtomicUsize::new(0),
            load_by_id_calls: AtomicUsize::new(0),
            serial_queries: AtomicUsize::new(0),
        }
    }
}

impl<T: Restampable> MockObjectStore<T> {
    /// Create an empty mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update `row`, stamping it with the next serial.
    /// Returns the stored row.
    pub fn save(&self, mut row: T) -> CacheResult<T> {
        let mut table = self.table.write().map_err(|_| StorageError::LockPoisoned)?;
        table.serial += 1;
        row.restamp(table.serial);
        table.rows.insert(row.object_id(), row.clone());
        Ok(row)
    }

    /// Delete the row with `id`. Returns whether it existed.
    pub fn delete(&self, id: ObjectId) -> CacheResult<bool> {
        let mut table = self.table.write().map_err(|_| StorageError::LockPoisoned)?;
        let existed = table.rows.remove(&id).is_some();
        if existed {
            table.serial += 1;
        }
        Ok(existed)
    }

    /// Stored row with `id`, bypassing the call counters.
    pub fn row(&self, id: ObjectId) -> CacheResult<Option<T>> {
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(table.rows.get(&id).cloned())
    }

    /// First row, in id order, matching `predicate`. Used by secondary
    /// index loaders; subject to failure injection like the trait calls.
    pub fn find(&self, predicate: impl Fn(&T) -> bool) -> CacheResult<Option<T>> {
        self.check_failure()?;
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(table.rows.values().find(|row| predicate(row)).cloned())
    }

    pub fn current_serial(&self) -> CacheResult<Serial> {
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(table.serial)
    }

    /// Get count of stored rows.
    pub fn row_count(&self) -> usize {
        self.table.read().map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Make the next storage call fail with `error`.
    pub fn fail_next(&self, error: StorageError) {
        if let Ok(mut failure) = self.failure.lock() {
            *failure = Some(error);
        }
    }

    pub fn load_all_calls(&self) -> usize {
        self.load_all_calls.load(Ordering::SeqCst)
    }

    pub fn load_by_id_calls(&self) -> usize {
        self.load_by_id_calls.load(Ordering::SeqCst)
    }

    pub fn serial_queries(&self) -> usize {
        self.serial_queries.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> CacheResult<()> {
        let mut failure = self.failure.lock().map_err(|_| StorageError::LockPoisoned)?;
        match failure.take() {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }
}

impl<T: Restampable> ObjectStore<T> for MockObjectStore<T> {
    fn load_by_id(
        &self,
        _session: &Session,
        _scope: &ScopeKey,
        id: ObjectId,
    ) -> CacheResult<Option<T>> {
        self.load_by_id_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.row(id)
    }

    fn load_all(&self, _session: &Session, scope: &ScopeKey) -> CacheResult<Vec<T>> {
        self.load_all_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(table
            .rows
            .values()
            .filter(|row| row.scope() == *scope)
            .cloned()
            .collect())
    }

    fn query_changed_serials(
        &self,
        _session: &Session,
        since: Serial,
        upto: Serial,
    ) -> CacheResult<Vec<SerialChange>> {
        self.serial_queries.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        let table = self.table.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut changes: Vec<SerialChange> = table
            .rows
            .values()
            .map(|row| SerialChange::new(row.object_id(), row.table_serial()))
            .filter(|change| change.serial > since && (upto == 0 || change.serial <= upto))
            .collect();
        changes.sort_by_key(|change| change.serial);
        Ok(changes)
    }

    fn query_current_serial(&self, _session: &Session, _scope: &ScopeKey) -> CacheResult<Serial> {
        self.serial_queries.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        self.current_serial()
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use tablecache_core::ConnectionId;

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

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// A scan returns rows sorted by serial, each row at most once, all
        /// strictly above the floor.
        #[test]
        fn prop_changed_serials_sorted_and_bounded(
            ids in proptest::collection::vec(1i64..20, 1..40),
            since in 0i64..40,
        ) {
            let store = MockObjectStore::new();
            for id in &ids {
                store.save(Row { id: *id, serial: 0 }).unwrap();
            }
            let session = Session::new(ConnectionId::now_v7());
            let changes = store.query_changed_serials(&session, since, 0).unwrap();

            prop_assert!(changes.windows(2).all(|w| w[0].serial < w[1].serial));
            prop_assert!(changes.iter().all(|c| c.serial > since));
            let mut seen: Vec<_> = changes.iter().map(|c| c.id).collect();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), changes.len());
        }
    }
}
