//! Pluggable indexes over the cached population.
//!
//! Every cache owns a permanent id index. Additional indexes are described
//! by an [`IndexSpec`] and attached at runtime; internally each attached
//! index is an ordered [`IndexTable`] hidden behind the object-safe
//! [`ErasedIndex`] trait so that one cache can hold indexes with different
//! key types.
//!
//! Index keys are global to a cache. A domain that needs per-scope
//! uniqueness includes the scope in its extracted key.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;
use std::sync::Arc;

use tablecache_core::{CacheResult, IndexError, ObjectId, ScopeKey, Session};

use super::traits::CachedObject;

/// Name of the mandatory id index.
pub const ID_INDEX: &str = "id";

/// Definition of a secondary index: how to extract its key from an object
/// and how to load an object by that key on a cache miss.
pub trait IndexSpec<T>: Send + Sync + 'static {
    /// Comparable key; ordering enables range selection.
    type Key: Ord + Clone + Debug + Send + Sync + 'static;

    /// Name of the index, unique within one cache.
    fn name(&self) -> &str;

    /// Pure function of the object's identifying attributes.
    fn extract(&self, object: &T) -> Self::Key;

    /// Load the object with `key` from storage.
    fn load(&self, session: &Session, scope: &ScopeKey, key: &Self::Key)
        -> CacheResult<Option<T>>;
}

/// Ordered key -> object mapping for one attached index.
pub struct IndexTable<T, I: IndexSpec<T>> {
    spec: Arc<I>,
    entries: BTreeMap<I::Key, Arc<T>>,
}

impl<T, I> IndexTable<T, I>
where
    T: CachedObject,
    I: IndexSpec<T>,
{
    pub fn new(spec: Arc<I>) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    pub fn spec(&self) -> &Arc<I> {
        &self.spec
    }

    /// Cache-only lookup.
    pub fn get(&self, key: &I::Key) -> Option<&Arc<T>> {
        self.entries.get(key)
    }

    /// Insert `object`. Returns false iff its key is already present; the
    /// caller then rolls back insertions made into other indexes.
    pub fn add(&mut self, object: &Arc<T>) -> bool {
        let key = self.spec.extract(object);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, Arc::clone(object));
        true
    }

    /// Insert an object the caller guarantees to be new.
    pub fn add_unique(&mut self, object: &Arc<T>) -> CacheResult<()> {
        if self.add(object) {
            Ok(())
        } else {
            Err(self.violation(object).into())
        }
    }

    /// Remove `object`. A key that maps to a different object means the
    /// object's key changed behind the cache's back.
    pub fn remove(&mut self, object: &T) -> CacheResult<bool> {
        let key = self.spec.extract(object);
        match self.entries.get(&key) {
            None => Ok(false),
            Some(cached) if cached.object_id() == object.object_id() => {
                self.entries.remove(&key);
                Ok(true)
            }
            Some(_) => Err(IndexError::KeyChanged {
                index: self.spec.name().to_string(),
                id: object.object_id(),
            }
            .into()),
        }
    }

    /// All cached objects in key order.
    pub fn objects(&self) -> Vec<Arc<T>> {
        self.entries.values().cloned().collect()
    }

    /// Cached objects with `from <= key <= to`.
    pub fn range(&self, from: &I::Key, to: &I::Key) -> Vec<Arc<T>> {
        if from > to {
            return Vec::new();
        }
        self.entries
            .range((Bound::Included(from), Bound::Included(to)))
            .map(|(_, object)| Arc::clone(object))
            .collect()
    }

    fn violation(&self, object: &T) -> IndexError {
        IndexError::UniqueViolation {
            index: self.spec.name().to_string(),
            key: format!("{:?}", self.spec.extract(object)),
        }
    }
}

/// Object-safe view of an [`IndexTable`].
pub trait ErasedIndex<T>: Send + Sync {
    fn name(&self) -> &str;

    fn add(&mut self, object: &Arc<T>) -> bool;

    fn add_unique(&mut self, object: &Arc<T>) -> CacheResult<()>;

    fn remove(&mut self, object: &T) -> CacheResult<bool>;

    /// The violation `object` would raise; used after a failed `add`.
    fn violation(&self, object: &T) -> IndexError;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn as_any(&self) -> &dyn Any;
}

impl<T, I> ErasedIndex<T> for IndexTable<T, I>
where
    T: CachedObject,
    I: IndexSpec<T>,
{
    fn name(&self) -> &str {
        self.spec.name()
    }

    fn add(&mut self, object: &Arc<T>) -> bool {
        IndexTable::add(self, object)
    }

    fn add_unique(&mut self, object: &Arc<T>) -> CacheResult<()> {
        IndexTable::add_unique(self, object)
    }

    fn remove(&mut self, object: &T) -> CacheResult<bool> {
        IndexTable::remove(self, object)
    }

    fn violation(&self, object: &T) -> IndexError {
        IndexTable::violation(self, object)
    }

    fn clear(&mut self) {
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Find the typed table for `name`, if it is attached with spec type `I`.
pub(crate) fn typed_table<'a, T, I>(
    indexes: &'a [Box<dyn ErasedIndex<T>>],
    name: &str,
) -> Option<&'a IndexTable<T, I>>
where
    T: CachedObject,
    I: IndexSpec<T>,
{
    indexes
        .iter()
        .find(|index| index.name() == name)
        .and_then(|index| index.as_any().downcast_ref::<IndexTable<T, I>>())
}

/// Unique violation for the id index.
pub(crate) fn id_violation(id: ObjectId) -> IndexError {
    IndexError::UniqueViolation {
        index: ID_INDEX.to_string(),
        key: id.to_string(),
    }
}
