//! Per-store identity map.
//!
//! Maps row identifiers to the single live in-memory [`Item`] for that row.
//! Entries are weak: the cache never keeps an item alive, and an item removes
//! its own entry when its last handle is dropped. Because only weak pointers
//! live here, no item is ever destroyed while the cache lock is held.

use std::collections::HashMap;
use std::sync::Weak;

use crate::item::{Item, ItemInner};

#[derive(Debug, Default)]
pub(crate) struct IdentityCache {
    entries: HashMap<i64, Weak<ItemInner>>,
}

impl IdentityCache {
    /// Live item for `id`, if one is cached.
    pub(crate) fn get(&self, id: i64) -> Option<Item> {
        self.entries.get(&id).and_then(Weak::upgrade).map(Item)
    }

    /// Cache `item`, replacing any stale entry for its id.
    pub(crate) fn insert(&mut self, item: &Item) {
        let _ = self.entries.insert(item.id(), item.downgrade());
    }

    /// Drop the entry for `item` if it is the cached instance.
    pub(crate) fn evict(&mut self, item: &Item) {
        let _ = self.release(item.id(), item.as_ptr());
    }

    /// Release hook: remove the entry for `id` only if it still points at
    /// `ptr`, so a newer instance for the same row is left in place.
    pub(crate) fn release(&mut self, id: i64, ptr: *const ItemInner) -> bool {
        match self.entries.get(&id) {
            Some(weak) if std::ptr::eq(weak.as_ptr(), ptr) => {
                let _ = self.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
