//! Bounded in-memory key-value store.

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::{KvError, Result};

/// Bookkeeping charged per entry on top of key and value bytes.
pub const ENTRY_OVERHEAD: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub value: Bytes,
    pub version: i32,
}

fn entry_size(key: &[u8], value: &[u8]) -> usize {
    key.len() + value.len() + ENTRY_OVERHEAD
}

/// Concurrent map with byte accounting against a fixed capacity.
#[derive(Debug)]
pub struct KeyValueStore {
    entries: DashMap<Bytes, StoredValue>,
    used: AtomicUsize,
    capacity: usize,
}

impl KeyValueStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            used: AtomicUsize::new(0),
            capacity,
        }
    }

    fn reserve(&self, bytes: usize) -> Result<()> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                debug!(used, requested = bytes, capacity = self.capacity, "Store is full");
                KvError::OutOfSpace
            })
    }

    /// Insert or overwrite. Fails with [`KvError::OutOfSpace`] when the new
    /// value does not fit; the previous value is then left in place.
    pub fn put(&self, key: Bytes, value: Bytes, version: i32) -> Result<()> {
        let new_size = entry_size(&key, &value);
        match self.entries.entry(key) {
            Entry::Occupied(mut entry) => {
                let old_size = entry_size(entry.key(), &entry.get().value);
                if new_size > old_size {
                    self.reserve(new_size - old_size)?;
                } else {
                    self.used.fetch_sub(old_size - new_size, Ordering::AcqRel);
                }
                entry.insert(StoredValue { value, version });
            }
            Entry::Vacant(entry) => {
                self.reserve(new_size)?;
                entry.insert(StoredValue { value, version });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<StoredValue> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Returns whether a value was removed.
    pub fn remove(&self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some((key, stored)) => {
                self.used
                    .fetch_sub(entry_size(&key, &stored.value), Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.entries.retain(|key, stored| {
            self.used
                .fetch_sub(entry_size(key, &stored.value), Ordering::AcqRel);
            false
        });
        trace!("Store cleared");
    }

    /// Point-in-time copy of every key.
    pub fn keys(&self) -> Vec<Bytes> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}
