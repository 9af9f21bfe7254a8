//! In-process object cache with serial-based expiration.
//!
//! Each domain type gets one [`ObjectCache`]: a write-through mirror of the
//! rows recently read or written, reachable through a permanent id index
//! and any number of attached secondary indexes ([`IndexSpec`]). Whole
//! "select all in scope" results are cached as [`ContextList`]s, and a
//! preloading cache loads a scope's complete population on first use.
//!
//! # Consistency
//!
//! Every row carries the table serial it was last saved with. A cache
//! tracks how far it has accounted for changes ([`SerialWatermarks`]) and,
//! on [`ObjectCache::expire`], asks storage for every row saved since. A
//! changed row is dropped from the indexes; a hole in the serial sequence
//! means a row was deleted and invalidates the whole cache.
//!
//! # Size
//!
//! A cache bounded by `max_size` is shrunk by an [`EvictionPolicy`]
//! (forget, LRU or LFU) whenever a lookup or an add finds it oversized.
//!
//! # Example
//!
//! ```ignore
//! let registry = CacheRegistry::new(CacheConfig::default())?;
//! let customers = registry.create_cache(
//!     TypeDescriptor::new("customer", "customers"),
//!     store,
//!     false,
//! )?;
//!
//! let by_name = Arc::new(CustomerNameIndex::new(store.clone()));
//! let alice = customers.select(&by_name, &session, &scope, &"alice".into(), true)?;
//!
//! // After other processes wrote to the table:
//! customers.expire(Some(&session), 0)?;
//! ```

pub mod context_list;
pub mod eviction;
pub mod expiration;
pub mod index;
pub mod object_cache;
pub mod registry;
pub mod traits;

pub use context_list::{ContextList, ListSlot};
pub use eviction::{AccessStats, EvictionPolicy, ShrinkPlan};
pub use expiration::{
    analyze_changes, ChangeAnalysis, ExpirationOutcome, SerialWatermarks, UNSET_SERIAL,
};
pub use index::{ErasedIndex, IndexSpec, IndexTable, ID_INDEX};
pub use object_cache::{EntryMeta, ObjectCache};
pub use registry::{CacheRegistry, CacheSwitch};
pub use traits::{CacheStats, CachedObject, ManagedCache};
