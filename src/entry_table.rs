//! EntryTable: row storage with stable generational handles.
//!
//! Rows live in a slot map; a hash index points at the rows that are
//! currently *linked*, i.e. visible to key lookups. A row can be detached
//! from the index while its slot stays alive, which lets a newer row for the
//! same key be linked while the old one waits for the cleanup pass. Slot
//! keys are generational, so a handle never aliases a row inserted after
//! the one it was minted for.
//!
//! Hashes are computed by the caller once per operation and stored per row;
//! the table never calls `K: Hash`.

use core::borrow::Borrow;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct Handle(DefaultKey);

impl Handle {
    pub(crate) fn new(k: DefaultKey) -> Self {
        Handle(k)
    }
    pub(crate) fn raw_handle(&self) -> DefaultKey {
        self.0
    }
}

#[derive(Debug)]
struct Row<K, V> {
    key: K,
    value: V,
    hash: u64,
    linked: bool,
}

pub(crate) struct EntryTable<K, V> {
    index: HashTable<DefaultKey>,
    rows: SlotMap<DefaultKey, Row<K, V>>,
}

impl<K, V> EntryTable<K, V> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            rows: SlotMap::with_capacity_and_key(capacity),
        }
    }

    /// Number of linked rows.
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Number of rows, linked or detached.
    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn find<Q>(&self, hash: u64, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.index
            .find(hash, |&k| {
                self.rows
                    .get(k)
                    .map(|r| r.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| Handle::new(k))
    }

    /// Link a new row for `key`. The caller guarantees no linked row for an
    /// equal key exists (it has just looked one up or detached it).
    /// `make` receives the key and the handle of the row being created.
    pub(crate) fn insert_unique_with<F>(&mut self, hash: u64, key: K, make: F) -> Handle
    where
        F: FnOnce(&K, Handle) -> V,
    {
        let k = self.rows.insert_with_key(|raw| {
            let value = make(&key, Handle::new(raw));
            Row {
                key,
                value,
                hash,
                linked: true,
            }
        });
        self.index.insert_unique(hash, k, |&kk| {
            self.rows.get(kk).map(|r| r.hash).unwrap_or(0)
        });
        Handle::new(k)
    }

    pub(crate) fn is_linked(&self, h: Handle) -> bool {
        self.rows
            .get(h.raw_handle())
            .map(|r| r.linked)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn get(&self, h: Handle) -> Option<(&K, &V)> {
        self.rows.get(h.raw_handle()).map(|r| (&r.key, &r.value))
    }

    pub(crate) fn value(&self, h: Handle) -> Option<&V> {
        self.rows.get(h.raw_handle()).map(|r| &r.value)
    }

    pub(crate) fn get_mut(&mut self, h: Handle) -> Option<(&K, &mut V)> {
        self.rows
            .get_mut(h.raw_handle())
            .map(|r| (&r.key, &mut r.value))
    }

    pub(crate) fn value_mut(&mut self, h: Handle) -> Option<&mut V> {
        self.rows.get_mut(h.raw_handle()).map(|r| &mut r.value)
    }

    /// Unlink a row from the index while keeping its slot alive. Returns
    /// true if the row was linked before the call.
    pub(crate) fn detach(&mut self, h: Handle) -> bool {
        let k = h.raw_handle();
        let Some(row) = self.rows.get_mut(k) else {
            return false;
        };
        if !row.linked {
            return false;
        }
        row.linked = false;
        let hash = row.hash;
        if let Ok(entry) = self.index.find_entry(hash, |&kk| kk == k) {
            entry.remove();
        }
        true
    }

    /// Delete a row and its slot, unlinking it first if needed. Stale
    /// handles return `None`.
    pub(crate) fn remove(&mut self, h: Handle) -> Option<(K, V)> {
        let k = h.raw_handle();
        let row = self.rows.remove(k)?;
        if row.linked {
            if let Ok(entry) = self.index.find_entry(row.hash, |&kk| kk == k) {
                entry.remove();
            }
        }
        Some((row.key, row.value))
    }

    /// Linked rows only.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Handle, &K, &V)> {
        self.rows
            .iter()
            .filter(|(_, r)| r.linked)
            .map(|(k, r)| (Handle::new(k), &r.key, &r.value))
    }

    /// Linked rows only.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &K, &mut V)> {
        self.rows
            .iter_mut()
            .filter(|(_, r)| r.linked)
            .map(|(k, r)| (Handle::new(k), &r.key, &mut r.value))
    }
}
