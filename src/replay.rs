//! Post-catch-up replay of known facts to stored subscribers.

use crate::error::Result;
use crate::registry::SubscriberRegistry;
use crate::scanner::FactScanner;
use std::sync::Arc;
use tracing::{debug, info};

/// Totals for one replay pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub subscribers: usize,
    pub facts: usize,
}

/// Re-drives facts for every registered subscriber.
///
/// Replay writes nothing, so running it again (for example after a restart
/// that happened before the previous pass finished) only re-emits facts.
pub struct ReplayEngine {
    registry: SubscriberRegistry,
    scanner: Arc<dyn FactScanner>,
}

impl ReplayEngine {
    pub fn new(registry: SubscriberRegistry, scanner: Arc<dyn FactScanner>) -> Self {
        Self { registry, scanner }
    }

    /// One full pass in registry key order.
    ///
    /// Stops at the first storage error. Facts already emitted stay emitted.
    pub fn replay_all(&self) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();

        for record in self.registry.list_all() {
            let record = record?;
            let facts = self.scanner.emit_events_for(&record.feed_identity)?;
            debug!(
                event = "replayed",
                handle = %record.channel_handle,
                identity = %record.feed_identity,
                facts,
            );
            summary.subscribers += 1;
            summary.facts += facts;
        }

        info!(
            event = "replay complete",
            subscribers = summary.subscribers,
            facts = summary.facts
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::kv::{KvIter, KvStore, MemoryStore};
    use crate::types::Sequence;
    use parking_lot::Mutex;

    /// Records which identities were replayed.
    #[derive(Default)]
    struct RecordingScanner {
        seen: Mutex<Vec<String>>,
    }

    impl FactScanner for RecordingScanner {
        fn current_sequence(&self) -> Option<Sequence> {
            None
        }

        fn emit_events_for(&self, identity: &str) -> Result<usize> {
            self.seen.lock().push(identity.to_string());
            Ok(2)
        }
    }

    /// Fails scans after yielding `ok_items` entries.
    struct FailingScan {
        inner: MemoryStore,
        ok_items: usize,
    }

    impl KvStore for FailingScan {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(key, value)
        }

        fn scan_range(&self, low: &[u8], high: Option<&[u8]>) -> KvIter<'_> {
            let ok_items = self.ok_items;
            Box::new(
                self.inner
                    .scan_range(low, high)
                    .take(ok_items)
                    .chain(std::iter::once(Err(StoreError::Corruption(
                        "bad sector".into(),
                    )))),
            )
        }
    }

    #[test]
    fn test_replays_every_subscriber_in_key_order() {
        let registry = SubscriberRegistry::new(Arc::new(MemoryStore::new()));
        registry.register("carol", "carol_npm").unwrap();
        registry.register("alice", "alice_npm").unwrap();

        let scanner = Arc::new(RecordingScanner::default());
        let engine = ReplayEngine::new(registry, scanner.clone());

        let summary = engine.replay_all().unwrap();
        assert_eq!(summary, ReplaySummary { subscribers: 2, facts: 4 });
        assert_eq!(*scanner.seen.lock(), vec!["alice_npm", "carol_npm"]);
    }

    #[test]
    fn test_empty_registry() {
        let registry = SubscriberRegistry::new(Arc::new(MemoryStore::new()));
        let engine = ReplayEngine::new(registry, Arc::new(RecordingScanner::default()));
        assert_eq!(engine.replay_all().unwrap(), ReplaySummary::default());
    }

    #[test]
    fn test_storage_error_aborts_pass_after_partial_progress() {
        let store = Arc::new(FailingScan {
            inner: MemoryStore::new(),
            ok_items: 1,
        });
        let registry = SubscriberRegistry::new(store);
        registry.register("alice", "a").unwrap();
        registry.register("bob", "b").unwrap();

        let scanner = Arc::new(RecordingScanner::default());
        let engine = ReplayEngine::new(registry, scanner.clone());

        assert!(matches!(engine.replay_all(), Err(StoreError::Corruption(_))));
        assert_eq!(*scanner.seen.lock(), vec!["a"]);
    }
}
