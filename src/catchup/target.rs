//! One-shot fetch of the catch-up target.

use crate::error::RelayError;
use crate::types::Sequence;
use async_trait::async_trait;
use serde::Deserialize;

/// Source of the feed position to catch up to.
#[async_trait]
pub trait TargetFetcher: Send + Sync {
    async fn fetch_target(&self) -> Result<Sequence, RelayError>;
}

/// Registry metadata document. Only `update_seq` matters.
#[derive(Debug, Deserialize)]
struct FeedInfo {
    update_seq: Sequence,
}

/// Reads `update_seq` from the registry's root document.
pub struct HttpTarget {
    client: reqwest::Client,
    url: String,
}

impl HttpTarget {
    pub fn new(client: reqwest::Client, registry_url: &str) -> Self {
        Self {
            client,
            url: registry_url.to_string(),
        }
    }

    /// Parse a metadata body.
    pub fn parse(body: &[u8]) -> Result<Sequence, RelayError> {
        let info: FeedInfo = serde_json::from_slice(body)
            .map_err(|e| RelayError::Fetch(format!("malformed registry metadata: {}", e)))?;
        Ok(info.update_seq)
    }
}

#[async_trait]
impl TargetFetcher for HttpTarget {
    async fn fetch_target(&self) -> Result<Sequence, RelayError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RelayError::Fetch(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Fetch(e.to_string()))?;
        Self::parse(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update_seq() {
        let body = br#"{"db_name":"registry","doc_count":3,"update_seq":8675309}"#;
        assert_eq!(HttpTarget::parse(body).unwrap(), Sequence(8675309));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(HttpTarget::parse(b"<html>"), Err(RelayError::Fetch(_))));
        assert!(matches!(
            HttpTarget::parse(br#"{"db_name":"registry"}"#),
            Err(RelayError::Fetch(_))
        ));
        assert!(matches!(
            HttpTarget::parse(br#"{"update_seq":"12-abc"}"#),
            Err(RelayError::Fetch(_))
        ));
    }
}
