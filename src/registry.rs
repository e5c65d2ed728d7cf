//! Durable subscriber registry.
//!
//! Each subscriber lives under `recipients/<encoded handle>`, so registering
//! the same handle twice overwrites the earlier record. Listing scans the
//! prefix in key order.

use crate::error::{Result, StoreError};
use crate::kv::{encode_key_component, KvStore};
use crate::types::SubscriberRecord;
use std::sync::Arc;
use tracing::debug;

/// Key prefix for subscriber records.
pub const RECIPIENT_PREFIX: &str = "recipients/";

/// Persisted set of subscribers, at most one per channel handle.
#[derive(Clone)]
pub struct SubscriberRegistry {
    store: Arc<dyn KvStore>,
}

impl SubscriberRegistry {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Deterministic key for a channel handle.
    pub fn key_for(channel_handle: &str) -> Vec<u8> {
        format!("{}{}", RECIPIENT_PREFIX, encode_key_component(channel_handle)).into_bytes()
    }

    /// Record (or replace) the subscriber for `channel_handle`.
    ///
    /// The record is durable once this returns.
    pub fn register(&self, channel_handle: &str, feed_identity: &str) -> Result<()> {
        let record = SubscriberRecord::new(channel_handle, feed_identity);
        let value = serde_json::to_vec(&record)?;
        self.store.put(&Self::key_for(channel_handle), &value)?;
        debug!(
            event = "subscriber registered",
            handle = channel_handle,
            identity = feed_identity
        );
        Ok(())
    }

    /// Look up a single subscriber.
    pub fn get(&self, channel_handle: &str) -> Result<Option<SubscriberRecord>> {
        match self.store.get(&Self::key_for(channel_handle))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every subscriber, in key order.
    ///
    /// Each call re-scans the store. The sequence ends after the first error;
    /// records yielded before it remain valid.
    pub fn list_all(&self) -> impl Iterator<Item = Result<SubscriberRecord>> + '_ {
        let mut failed = false;
        self.store
            .scan_prefix(RECIPIENT_PREFIX.as_bytes())
            .map_while(move |item| {
                if failed {
                    return None;
                }
                let record = item.and_then(|(_, value)| decode_record(&value));
                failed = record.is_err();
                Some(record)
            })
    }

    /// Number of registered subscribers.
    pub fn count(&self) -> Result<usize> {
        let mut n = 0;
        for record in self.list_all() {
            record?;
            n += 1;
        }
        Ok(n)
    }
}

fn decode_record(bytes: &[u8]) -> Result<SubscriberRecord> {
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Deserialization(format!("subscriber record: {}", e)))
}
