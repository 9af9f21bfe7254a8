//! Cached "all objects in scope" lists.

use std::collections::BTreeSet;
use std::sync::Arc;

use tablecache_core::{ConnectionId, ObjectId};

use super::traits::CachedObject;

/// One entry of a context list. `expired` replaces the object-level
/// expired flag: the object was removed from the indexes and must be
/// reloaded before the list is handed out again.
#[derive(Debug)]
pub struct ListSlot<T> {
    pub object: Arc<T>,
    pub expired: bool,
}

/// Ordered, complete result of a "select all" for one scope.
///
/// A list is either a correct snapshot or marked `pending_rescan`; a list
/// that cannot be repaired is dropped, never handed out.
#[derive(Debug)]
pub struct ContextList<T> {
    connection: ConnectionId,
    slots: Vec<ListSlot<T>>,
    pending_rescan: bool,
}

impl<T: CachedObject> ContextList<T> {
    pub fn new(connection: ConnectionId, objects: Vec<Arc<T>>) -> Self {
        Self {
            connection,
            slots: objects
                .into_iter()
                .map(|object| ListSlot {
                    object,
                    expired: false,
                })
                .collect(),
            pending_rescan: false,
        }
    }

    /// Connection the list was loaded through.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_pending_rescan(&self) -> bool {
        self.pending_rescan
    }

    /// Flag every slot whose id is in `ids` and mark the list for rescan.
    /// Returns the number of slots flagged.
    pub fn mark_expired(&mut self, ids: &BTreeSet<ObjectId>) -> usize {
        let mut flagged = 0;
        for slot in &mut self.slots {
            if ids.contains(&slot.object.object_id()) {
                slot.expired = true;
                flagged += 1;
            }
        }
        self.pending_rescan = true;
        flagged
    }

    /// Ids of the slots that must be reloaded.
    pub fn expired_ids(&self) -> Vec<ObjectId> {
        self.slots
            .iter()
            .filter(|slot| slot.expired)
            .map(|slot| slot.object.object_id())
            .collect()
    }

    /// Replace the expired slot for `id` with `refreshed`, or drop it when
    /// the row vanished.
    pub fn repair(&mut self, id: ObjectId, refreshed: Option<Arc<T>>) {
        match refreshed {
            Some(object) => {
                for slot in self
                    .slots
                    .iter_mut()
                    .filter(|slot| slot.expired && slot.object.object_id() == id)
                {
                    slot.object = Arc::clone(&object);
                    slot.expired = false;
                }
            }
            None => self
                .slots
                .retain(|slot| !(slot.expired && slot.object.object_id() == id)),
        }
    }

    /// Clear the pending flag once every expired slot has been repaired.
    pub fn finish_rescan(&mut self) {
        debug_assert!(self.slots.iter().all(|slot| !slot.expired));
        self.pending_rescan = false;
    }

    /// Replace every slot holding `object`'s id, or append it when the list
    /// does not hold it yet.
    pub fn upsert(&mut self, object: Arc<T>) {
        let id = object.object_id();
        let mut found = false;
        for slot in self.slots.iter_mut().filter(|slot| slot.object.object_id() == id) {
            slot.object = Arc::clone(&object);
            slot.expired = false;
            found = true;
        }
        if !found {
            self.slots.push(ListSlot {
                object,
                expired: false,
            });
        }
    }

    /// Drop the object with `id`. Returns true if it was listed.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let before = self.slots.len();
        self.slots.retain(|slot| slot.object.object_id() != id);
        self.slots.len() != before
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.slots.iter().any(|slot| slot.object.object_id() == id)
    }

    /// Structurally independent copy of the list, in list order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.slots.iter().map(|slot| Arc::clone(&slot.object)).collect()
    }
}
