//! Property tests for the subscriber registry and cursor.

use intervention_relay::{
    CursorState, MemoryStore, Sequence, StoreError, SubscriberRecord, SubscriberRegistry,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn handle() -> impl Strategy<Value = String> {
    // Mix of plain handles and ones that need escaping
    prop_oneof![
        "[a-z_]{1,12}",
        "@[a-zA-Z0-9_]{1,12}",
        "[a-z]{1,4}[ /~%@][a-z]{1,4}",
        "\\PC{1,8}",
    ]
}

proptest! {
    #[test]
    fn repeated_registration_keeps_latest(
        handle in handle(),
        identities in prop::collection::vec("[a-z0-9-]{1,16}", 1..8),
    ) {
        let registry = SubscriberRegistry::new(Arc::new(MemoryStore::new()));
        for identity in &identities {
            registry.register(&handle, identity).unwrap();
        }

        let all: Vec<SubscriberRecord> = registry.list_all().map(|r| r.unwrap()).collect();
        prop_assert_eq!(all.len(), 1);
        prop_assert_eq!(&all[0].channel_handle, &handle);
        prop_assert_eq!(&all[0].feed_identity, identities.last().unwrap());
    }

    #[test]
    fn list_all_round_trips_every_registration(
        entries in prop::collection::btree_map(handle(), "[a-z0-9-]{1,16}", 0..24),
    ) {
        let registry = SubscriberRegistry::new(Arc::new(MemoryStore::new()));
        for (handle, identity) in &entries {
            registry.register(handle, identity).unwrap();
        }

        let listed: BTreeMap<String, String> = registry
            .list_all()
            .map(|r| r.unwrap())
            .map(|r| (r.channel_handle, r.feed_identity))
            .collect();
        prop_assert_eq!(listed, entries.clone());
        prop_assert_eq!(registry.count().unwrap(), entries.len());
    }

    #[test]
    fn listing_follows_encoded_key_order(
        handles in prop::collection::btree_set(handle(), 0..16),
    ) {
        let registry = SubscriberRegistry::new(Arc::new(MemoryStore::new()));
        for handle in &handles {
            registry.register(handle, "x").unwrap();
        }

        let keys: Vec<Vec<u8>> = registry
            .list_all()
            .map(|r| SubscriberRegistry::key_for(&r.unwrap().channel_handle))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
    }

    #[test]
    fn cursor_never_moves_backwards(
        writes in prop::collection::vec(0u64..1000, 1..32),
    ) {
        let cursor = CursorState::open(Arc::new(MemoryStore::new())).unwrap();
        let mut high: Option<u64> = None;

        for n in writes {
            let result = cursor.advance(Sequence(n));
            match high {
                Some(h) if n < h => {
                    prop_assert!(
                        matches!(result, Err(StoreError::InvalidSequence(_, _))),
                        "regression accepted"
                    );
                }
                _ => {
                    prop_assert!(result.is_ok());
                    high = Some(n);
                }
            }
            prop_assert_eq!(cursor.load().unwrap(), high.map(Sequence));
        }
    }
}
