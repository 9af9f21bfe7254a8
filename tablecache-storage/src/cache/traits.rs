//! Cached object trait, cache statistics and the registry-facing cache trait.

use serde::Serialize;
use tablecache_core::{CacheResult, ConnectionId, ObjectId, ScopeKey, Serial};

/// Trait for domain objects that can be held by an [`ObjectCache`].
///
/// # Implementation Requirements
///
/// - `object_id()` must be positive and never change for one object
/// - `table_serial()` is the table serial the row was last saved with
/// - `scope()` is the scope the object was loaded under
/// - Implementations must be `Send + Sync + 'static`; the cache shares
///   objects as `Arc<T>` with the persistence layer and never mutates them
///
/// Cache bookkeeping (access statistics, the expired flag, the owning
/// connection) is kept inside the cache, not on the object.
///
/// [`ObjectCache`]: super::ObjectCache
pub trait CachedObject: Send + Sync + 'static {
    /// Primary identifier of the row.
    fn object_id(&self) -> ObjectId;

    /// Serial the row was last saved with.
    fn table_serial(&self) -> Serial;

    /// Scope the object belongs to.
    fn scope(&self) -> ScopeKey;

    /// Objects may opt out of caching, e.g. when only partially loaded.
    fn is_cacheable(&self) -> bool {
        true
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups answered from an index.
    pub hits: u64,
    /// Lookups that missed every index.
    pub misses: u64,
    /// Rows fetched from storage (point loads, preloads and list repairs).
    pub loads: u64,
    /// Objects dropped by eviction passes.
    pub evictions: u64,
    /// Full invalidations, whatever their cause.
    pub invalidations: u64,
    /// Objects flagged expired by the serial protocol.
    pub expirations: u64,
    /// Unique violations and key changes that forced a retry.
    pub conflicts: u64,
    /// Objects currently held in the id index.
    pub entry_count: u64,
    /// Context lists currently cached.
    pub list_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Type-independent view of a cache, as held by the registry.
pub trait ManagedCache: Send + Sync {
    /// Name of the cached domain type.
    fn name(&self) -> &str;

    /// Number of objects in the id index.
    fn size(&self) -> CacheResult<usize>;

    /// Drop all objects and lists.
    fn invalidate(&self) -> CacheResult<()>;

    /// Drop every object and list loaded through `connection`.
    /// Returns the number of objects removed.
    fn remove_for_connection(&self, connection: ConnectionId) -> CacheResult<usize>;

    fn stats(&self) -> CacheResult<CacheStats>;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;
}
