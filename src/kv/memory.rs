//! In-memory key-value store.

use super::{KvIter, KvStore};
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// Volatile [`KvStore`] backed by a `BTreeMap`.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_range(&self, low: &[u8], high: Option<&[u8]>) -> KvIter<'_> {
        let upper = match high {
            Some(h) => Bound::Excluded(h.to_vec()),
            None => Bound::Unbounded,
        };
        if let Bound::Excluded(ref h) = upper {
            if h.as_slice() <= low {
                return Box::new(std::iter::empty());
            }
        }

        // Snapshot so callers never hold the lock while iterating.
        let snapshot: Vec<_> = self
            .entries
            .read()
            .range((Bound::Included(low.to_vec()), upper))
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        Box::new(snapshot.into_iter())
    }
}
