//! Notification sink: where live mentions come from.

use crate::error::RelayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Mentions buffered between the sink and the relay.
const MENTION_BUFFER: usize = 256;

/// A mention of the tracked handle.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    /// Who mentioned us.
    pub handle: String,
    /// Feed identity the sender asked to be notified for, if any.
    #[serde(default)]
    pub feed_identity: Option<String>,
    /// Original message, passed through untouched.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Live mention stream, started once the relay has caught up.
#[async_trait]
pub trait NotificationSink: Send {
    /// Begin listening for mentions of `track`.
    async fn start_listening(&mut self, track: &str)
        -> Result<mpsc::Receiver<Mention>, RelayError>;
}

/// Reads one JSON [`Mention`] per line from an async reader.
///
/// Malformed lines are logged and skipped. The channel closes at EOF.
pub struct JsonLinesSink<R> {
    reader: Option<R>,
}

impl<R> JsonLinesSink<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
        }
    }
}

#[async_trait]
impl<R> NotificationSink for JsonLinesSink<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn start_listening(
        &mut self,
        track: &str,
    ) -> Result<mpsc::Receiver<Mention>, RelayError> {
        let reader = self
            .reader
            .take()
            .ok_or_else(|| RelayError::Sink("already listening".into()))?;
        let (tx, rx) = mpsc::channel(MENTION_BUFFER);

        info!(event = "listening", track = %track);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(event = "sink read failed", error = %e);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Mention>(&line) {
                    Ok(mention) => {
                        if tx.send(mention).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "malformed mention", error = %e),
                }
            }
            debug!(event = "sink closed");
        });

        Ok(rx)
    }
}
