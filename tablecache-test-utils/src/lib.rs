//! tablecache Test Utilities
//!
//! Centralized test infrastructure for the tablecache workspace:
//! - A `Customer` domain fixture with a unique name index
//! - Proptest generators for rows, scopes and configurations
//! - Test fixtures for common cache setups
//! - Custom assertions for cache results

// Re-export mock storage from its source crate
pub use tablecache_storage::{MockObjectStore, ObjectStore, Restampable};

// Re-export core and cache types for convenience
pub use tablecache_core::{
    CacheConfig, CacheError, CacheResult, ConfigError, ConnectionId, EvictionStrategy,
    IndexError, ObjectId, ScopeKey, Serial, SerialChange, Session, StorageError, TypeDescriptor,
};
pub use tablecache_storage::{
    CacheRegistry, CacheStats, CachedObject, ExpirationOutcome, IndexSpec, ManagedCache,
    ObjectCache,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// DOMAIN FIXTURE
// ============================================================================

/// Row of the `customers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: ObjectId,
    /// Unique within the table.
    pub name: String,
    pub city: String,
    pub scope: ScopeKey,
    pub serial: Serial,
}

impl Customer {
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            city: "Berlin".to_string(),
            scope: ScopeKey::global(),
            serial: 0,
        }
    }

    pub fn in_scope(mut self, scope: ScopeKey) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = city.into();
        self
    }

    pub fn with_serial(mut self, serial: Serial) -> Self {
        self.serial = serial;
        self
    }
}

impl CachedObject for Customer {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn table_serial(&self) -> Serial {
        self.serial
    }

    fn scope(&self) -> ScopeKey {
        self.scope
    }
}

impl Restampable for Customer {
    fn restamp(&mut self, serial: Serial) {
        self.serial = serial;
    }
}

/// Unique index on `Customer::name`, loading misses from the mock store.
#[derive(Debug, Clone)]
pub struct CustomerNameIndex {
    store: Arc<MockObjectStore<Customer>>,
}

impl CustomerNameIndex {
    pub const NAME: &'static str = "name";

    pub fn new(store: Arc<MockObjectStore<Customer>>) -> Self {
        Self { store }
    }
}

impl IndexSpec<Customer> for CustomerNameIndex {
    type Key = String;

    fn name(&self) -> &str {
        Self::NAME
    }

    fn extract(&self, object: &Customer) -> String {
        object.name.clone()
    }

    fn load(
        &self,
        _session: &Session,
        scope: &ScopeKey,
        key: &String,
    ) -> CacheResult<Option<Customer>> {
        self.store
            .find(|customer| customer.scope == *scope && &customer.name == key)
    }
}

/// Cache of customers backed by the mock store.
pub type CustomerCache = ObjectCache<Customer, MockObjectStore<Customer>>;

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating cache inputs.

    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    /// Generate a random ScopeKey.
    pub fn arb_scope_key() -> impl Strategy<Value = ScopeKey> {
        any::<[u8; 16]>().prop_map(|bytes| ScopeKey::new(Uuid::from_bytes(bytes)))
    }

    /// Generate a customer name; short alphabet so collisions happen.
    pub fn arb_customer_name() -> impl Strategy<Value = String> {
        "[a-e]{1,3}"
    }

    /// Generate a customer with the given id in the global scope.
    pub fn arb_customer(id: ObjectId) -> impl Strategy<Value = Customer> {
        (arb_customer_name(), "[A-Z][a-z]{2,8}")
            .prop_map(move |(name, city)| Customer::new(id, name).with_city(city))
    }

    /// Generate customers with ids `1..=n` and pairwise distinct names.
    pub fn arb_distinct_customers(max: usize) -> impl Strategy<Value = Vec<Customer>> {
        prop::collection::btree_set("[a-z]{3,8}", 1..=max).prop_map(|names| {
            names
                .into_iter()
                .enumerate()
                .map(|(i, name)| Customer::new(i as ObjectId + 1, name))
                .collect()
        })
    }

    /// Generate an EvictionStrategy variant.
    pub fn arb_eviction_strategy() -> impl Strategy<Value = EvictionStrategy> {
        prop_oneof![
            Just(EvictionStrategy::Forget),
            Just(EvictionStrategy::Lru),
            Just(EvictionStrategy::Lfu),
        ]
    }

    /// Generate a valid CacheConfig.
    pub fn arb_valid_config() -> impl Strategy<Value = CacheConfig> {
        (0usize..64, arb_eviction_strategy(), 0u32..=100, 0u32..4).prop_map(
            |(max_size, strategy, keep_quota, retries)| {
                CacheConfig::default()
                    .with_max_size(max_size)
                    .with_strategy(strategy)
                    .with_keep_quota(keep_quota)
                    .with_max_conflict_retries(retries)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Descriptor of the customer cache.
    pub fn customer_descriptor() -> TypeDescriptor {
        TypeDescriptor::new("customer", "customers")
    }

    /// A session outside of any transaction on a fresh connection.
    pub fn session() -> Session {
        Session::new(ConnectionId::now_v7())
    }

    /// Mock store holding customers `1..=count`, named `customer-<id>` and
    /// saved with serials `1..=count`.
    pub fn seeded_store(count: ObjectId) -> Arc<MockObjectStore<Customer>> {
        let store = Arc::new(MockObjectStore::new());
        for id in 1..=count {
            // A fresh store cannot be poisoned.
            let _ = store.save(Customer::new(id, format!("customer-{id}")));
        }
        store
    }

    /// Registry with `config` plus a registered customer cache over `store`.
    pub fn customer_cache(
        store: &Arc<MockObjectStore<Customer>>,
        preloading: bool,
        config: CacheConfig,
    ) -> CacheResult<(CacheRegistry, Arc<CustomerCache>)> {
        let registry = CacheRegistry::new(config)?;
        let cache = registry.create_cache(customer_descriptor(), Arc::clone(store), preloading)?;
        Ok((registry, cache))
    }

    /// The name index over `store`, ready to pass to `select`.
    pub fn name_index(store: &Arc<MockObjectStore<Customer>>) -> Arc<CustomerNameIndex> {
        Arc::new(CustomerNameIndex::new(Arc::clone(store)))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for cache results.

    use super::*;

    /// Assert that a CacheResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &CacheResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a CacheResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a CacheResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }

    /// Assert that retries were exhausted for `operation`.
    #[track_caller]
    pub fn assert_retries_exhausted<T: std::fmt::Debug>(result: &CacheResult<T>, operation: &str) {
        match result {
            Err(CacheError::ConflictRetriesExhausted { operation: op, .. }) => {
                assert_eq!(*op, operation, "Wrong operation in retry error");
            }
            other => panic!("Expected ConflictRetriesExhausted, got: {:?}", other),
        }
    }

    /// Assert that `objects` hold exactly `ids`, in order.
    #[track_caller]
    pub fn assert_ids<T: CachedObject>(objects: &[Arc<T>], ids: &[ObjectId]) {
        let actual: Vec<ObjectId> = objects.iter().map(|o| o.object_id()).collect();
        assert_eq!(actual, ids, "Unexpected objects");
    }

    /// Assert that the cache holds exactly `ids`.
    #[track_caller]
    pub fn assert_cached(cache: &CustomerCache, ids: &[ObjectId]) {
        let cached = cache.cached_ids().unwrap_or_default();
        assert_eq!(cached, ids, "Unexpected cache population");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_seeded_store_fixture() {
        let store = fixtures::seeded_store(3);
        assert_eq!(store.row_count(), 3);
        assert_eq!(store.current_serial().unwrap(), 3);
        assert_eq!(store.row(2).unwrap().unwrap().name, "customer-2");
    }

    #[test]
    fn test_name_index_loads_from_store() {
        let store = fixtures::seeded_store(3);
        let index = fixtures::name_index(&store);
        let found = index
            .load(
                &fixtures::session(),
                &ScopeKey::global(),
                &"customer-3".to_string(),
            )
            .unwrap();
        assert_eq!(found.map(|c| c.id), Some(3));
        assert_eq!(index.extract(&Customer::new(7, "x")), "x");
    }

    #[test]
    fn test_customer_cache_fixture() {
        let store = fixtures::seeded_store(1);
        let (registry, cache) =
            fixtures::customer_cache(&store, false, CacheConfig::default()).unwrap();
        assert_eq!(registry.names().unwrap(), vec!["customer".to_string()]);
        assert!(!cache.is_preloading());
    }

    #[test]
    fn test_assertion_retries_exhausted() {
        let result: CacheResult<()> = Err(CacheError::ConflictRetriesExhausted {
            cache: "customer".to_string(),
            operation: "add",
            attempts: 3,
        });
        assertions::assert_retries_exhausted(&result, "add");
    }

    #[test]
    fn test_customer_serde_round_trip() {
        let customer = Customer::new(1, "alice").with_serial(4);
        let json = serde_json::to_string(&customer).unwrap();
        let back: Customer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, customer);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_generated_config_is_valid(config in generators::arb_valid_config()) {
            prop_assert!(config.validate().is_ok());
        }

        #[test]
        fn prop_distinct_customers_have_unique_names(
            customers in generators::arb_distinct_customers(20),
        ) {
            let mut names: Vec<_> = customers.iter().map(|c| c.name.clone()).collect();
            names.sort();
            names.dedup();
            prop_assert_eq!(names.len(), customers.len());
        }
    }
}
