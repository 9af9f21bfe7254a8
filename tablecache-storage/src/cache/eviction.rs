//! Eviction policy for oversized caches.
//!
//! Planning is pure: the cache hands over the access statistics of its
//! population and gets back which objects to drop or keep.

use std::cmp::Ordering;

use tablecache_core::{EvictionStrategy, ObjectId};

/// Access statistics of one cached object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessStats {
    pub id: ObjectId,
    pub access_count: u64,
    /// Logical time of the last access; strictly increasing per cache.
    pub access_tick: u64,
}

/// What an eviction pass should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShrinkPlan {
    /// Drop the whole cache.
    InvalidateAll,
    /// Remove these objects one by one, coldest first.
    RemoveColdest(Vec<ObjectId>),
    /// Invalidate, then re-insert only these objects, warmest last.
    KeepWarmest(Vec<ObjectId>),
}

/// Size bound plus strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Maximum number of objects; 0 means unlimited.
    pub max_size: usize,
    pub strategy: EvictionStrategy,
    /// Percentage of `max_size` retained by a pass.
    pub keep_quota: u32,
}

impl EvictionPolicy {
    pub fn new(max_size: usize, strategy: EvictionStrategy, keep_quota: u32) -> Self {
        Self {
            max_size,
            strategy,
            keep_quota,
        }
    }

    pub fn needs_shrink(&self, size: usize) -> bool {
        self.max_size > 0 && size > self.max_size
    }

    /// Number of objects a pass over `size` objects keeps.
    ///
    /// At most `max_size * keep_quota / 100`, at least one, and always at
    /// least one object fewer than before. An unlimited cache that is
    /// shrunk explicitly uses its current size as the capacity.
    pub fn keep_count(&self, size: usize) -> usize {
        if size <= 1 {
            return 0;
        }
        let capacity = if self.max_size > 0 { self.max_size } else { size };
        let quota = capacity * self.keep_quota as usize / 100;
        quota.min(size - 1).max(1)
    }

    /// Plan a pass over `population`.
    pub fn plan(&self, population: &[AccessStats]) -> ShrinkPlan {
        if self.strategy == EvictionStrategy::Forget || self.keep_quota == 0 {
            return ShrinkPlan::InvalidateAll;
        }

        let size = population.len();
        let keep = self.keep_count(size);
        if keep == 0 {
            return ShrinkPlan::InvalidateAll;
        }

        let mut ordered: Vec<AccessStats> = population.to_vec();
        ordered.sort_by(|a, b| self.compare_coldness(a, b));

        if keep * 2 > size {
            // Few victims: cheaper to remove them individually.
            ShrinkPlan::RemoveColdest(ordered[..size - keep].iter().map(|s| s.id).collect())
        } else {
            ShrinkPlan::KeepWarmest(ordered[size - keep..].iter().map(|s| s.id).collect())
        }
    }

    /// Total order, coldest first. Ties on the primary metric fall back to
    /// the other metric, then to the id.
    fn compare_coldness(&self, a: &AccessStats, b: &AccessStats) -> Ordering {
        let primary = match self.strategy {
            EvictionStrategy::Lfu => a
                .access_count
                .cmp(&b.access_count)
                .then(a.access_tick.cmp(&b.access_tick)),
            EvictionStrategy::Lru | EvictionStrategy::Forget => a
                .access_tick
                .cmp(&b.access_tick)
                .then(a.access_count.cmp(&b.access_count)),
        };
        primary.then(a.id.cmp(&b.id))
    }
}
