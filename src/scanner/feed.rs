//! Change feed polling.

use super::{Change, RelationScanner};
use crate::error::RelayError;
use crate::retry::RetryPolicy;
use crate::scanner::FactScanner;
use crate::types::Sequence;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A page of changes.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ChangeBatch {
    #[serde(rename = "results")]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub last_seq: Option<Sequence>,
}

/// Where changes come from.
#[async_trait]
pub trait ChangeSource: Send {
    /// Fetch the next page of changes strictly after `since`
    /// (`None` = from the origin). An empty page means nothing new yet.
    async fn next_batch(&mut self, since: Option<Sequence>) -> Result<ChangeBatch, RelayError>;
}

/// Pages through a CouchDB-style `_changes` endpoint.
pub struct CouchChanges {
    client: reqwest::Client,
    url: String,
    batch_size: usize,
}

impl CouchChanges {
    pub fn new(client: reqwest::Client, registry_url: &str, batch_size: usize) -> Self {
        Self {
            client,
            url: format!("{}/_changes", registry_url.trim_end_matches('/')),
            batch_size,
        }
    }
}

#[async_trait]
impl ChangeSource for CouchChanges {
    async fn next_batch(&mut self, since: Option<Sequence>) -> Result<ChangeBatch, RelayError> {
        let mut query = vec![
            ("limit", self.batch_size.to_string()),
            ("include_docs", "true".to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.0.to_string()));
        }

        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Feed(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Feed(e.to_string()))?;

        serde_json::from_slice(&body)
            .map_err(|e| RelayError::Feed(format!("malformed changes page: {}", e)))
    }
}

/// Drive `scanner` from `source` forever.
///
/// Feed errors are logged and retried with capped backoff. Storage errors
/// are returned, since the cursor can no longer be trusted.
pub async fn follow(
    scanner: Arc<RelationScanner>,
    mut source: Box<dyn ChangeSource>,
    idle_interval: Duration,
    retry: RetryPolicy,
) -> Result<(), RelayError> {
    let mut backoff = retry.initial_backoff;

    loop {
        let since = scanner.current_sequence();
        let batch = match source.next_batch(since).await {
            Ok(batch) => {
                backoff = retry.initial_backoff;
                batch
            }
            Err(e) => {
                warn!(event = "feed poll failed", since = ?since, error = %e, retry_in = ?backoff);
                tokio::time::sleep(backoff).await;
                backoff = retry.next_backoff(backoff);
                continue;
            }
        };

        if batch.changes.is_empty() {
            tokio::time::sleep(idle_interval).await;
            continue;
        }

        let mut emitted = 0;
        for change in &batch.changes {
            emitted += scanner.process(change)?;
        }
        debug!(
            event = "batch applied",
            changes = batch.changes.len(),
            relations = emitted,
            sequence = ?scanner.current_sequence(),
        );

        // Let the coordinator observe progress between pages.
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_page_shape() {
        let body = br#"{
            "results": [
                {"seq": 1, "id": "left-pad", "changes": [{"rev": "1-a"}], "doc": {"name": "left-pad"}},
                {"seq": 2, "id": "gone", "deleted": true}
            ],
            "last_seq": 2
        }"#;
        let batch: ChangeBatch = serde_json::from_slice(body).unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.changes[0].seq, Sequence(1));
        assert!(batch.changes[0].doc.is_some());
        assert!(batch.changes[1].deleted);
        assert_eq!(batch.last_seq, Some(Sequence(2)));
    }

    #[test]
    fn test_changes_url() {
        let client = reqwest::Client::new();
        let source = CouchChanges::new(client, "https://replicate.npmjs.com/", 50);
        assert_eq!(source.url, "https://replicate.npmjs.com/_changes");
    }

    /// Fails `failures` times, then serves `page` once, then stays empty.
    struct FlakyFeed {
        failures: u32,
        calls: Arc<std::sync::atomic::AtomicU32>,
        page: Option<Vec<Change>>,
    }

    #[async_trait]
    impl ChangeSource for FlakyFeed {
        async fn next_batch(&mut self, _since: Option<Sequence>) -> Result<ChangeBatch, RelayError> {
            let n = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.failures {
                return Err(RelayError::Feed("503 Service Unavailable".into()));
            }
            Ok(ChangeBatch {
                changes: self.page.take().unwrap_or_default(),
                last_seq: None,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_survives_feed_errors() {
        use crate::bus::EventBus;
        use crate::kv::MemoryStore;

        let scanner = Arc::new(
            RelationScanner::open(Arc::new(MemoryStore::new()), Arc::new(EventBus::new())).unwrap(),
        );
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let source = FlakyFeed {
            failures: 4,
            calls: calls.clone(),
            page: Some(vec![Change {
                seq: Sequence(7),
                id: "left-pad".into(),
                deleted: false,
                doc: Some(serde_json::json!({"name": "left-pad"})),
            }]),
        };

        let task = tokio::spawn(follow(
            scanner.clone(),
            Box::new(source),
            Duration::from_secs(1),
            RetryPolicy::default(),
        ));

        for _ in 0..600 {
            if scanner.current_sequence() == Some(Sequence(7)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(scanner.current_sequence(), Some(Sequence(7)));
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) > 4);

        // Keeps polling the empty feed rather than returning
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!task.is_finished());
        task.abort();
    }
}
