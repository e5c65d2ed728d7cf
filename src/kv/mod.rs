//! Ordered key-value storage.
//!
//! Everything the relay persists goes through the [`KvStore`] contract:
//! point reads, durable writes and lazy range scans over byte-string keys.
//! Keys are namespaced by the components that own them:
//!
//! - `sequence` - the scan cursor
//! - `recipients/<handle>` - subscriber records
//! - `packages/<name>` - package metadata seen in the feed
//! - `dependents/<dependency>/<depending>` - derived relations
//!
//! Two engines implement the contract: [`FileStore`], a log-structured store
//! with checksummed entries, and [`MemoryStore`] for tests and tooling.

mod log;
mod memory;

pub use log::{FileStore, StoreConfig, StoreStats};
pub use memory::MemoryStore;

use crate::error::Result;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// A key and its value.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy iterator over a key range. Stops after the first error.
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<KvPair>> + 'a>;

/// Generic ordered key-value storage.
pub trait KvStore: Send + Sync {
    /// Read a value. `Ok(None)` when the key was never written.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write a value, replacing any previous one. Durable once this returns.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Iterate `[low, high)` in key order. `high = None` scans to the end.
    fn scan_range(&self, low: &[u8], high: Option<&[u8]>) -> KvIter<'_>;

    /// Iterate every key starting with `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> KvIter<'_> {
        let (low, high) = prefix_range(prefix);
        self.scan_range(&low, high.as_deref())
    }
}

/// Half-open bounds covering every key that starts with `prefix`.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
    (prefix.to_vec(), prefix_successor(prefix))
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns `None` when no such key exists (empty or all-`0xFF` prefix).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut upper = prefix.to_vec();
    while let Some(last) = upper.pop() {
        if last < u8::MAX {
            upper.push(last + 1);
            return Some(upper);
        }
    }
    None
}

/// Characters `encodeURIComponent` escapes: everything except
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
const KEY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Escape a string for use as a key segment.
///
/// Non-ASCII input is percent-encoded byte by byte as UTF-8, so `/` never
/// appears inside a segment.
pub fn encode_key_component(raw: &str) -> String {
    utf8_percent_encode(raw, KEY_COMPONENT).to_string()
}
