//! Process orchestration.
//!
//! [`Relay`] wires the scanner, coordinator, registry, replay engine and
//! notification sink around one [`RelayContext`]. Its `run` future is the
//! whole service: backfill until the startup target is reached, go live
//! once, then serve mentions while the scanner keeps following the feed.

use crate::bus::EventBus;
use crate::catchup::{CatchUpCoordinator, LiveTransition, ModeCell, TargetFetcher};
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::kv::{FileStore, KvStore, StoreConfig};
use crate::registry::SubscriberRegistry;
use crate::replay::{ReplayEngine, ReplaySummary};
use crate::scanner::{follow, ChangeSource, FactScanner, RelationScanner};
use crate::sink::{Mention, NotificationSink};
use crate::types::Mode;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Shared handles, built once per process.
#[derive(Clone)]
pub struct RelayContext {
    pub store: Arc<dyn KvStore>,
    pub bus: Arc<EventBus>,
}

impl RelayContext {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            bus: Arc::new(EventBus::new()),
        }
    }

    /// Open (or create) the durable store at `config.path`.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let store = FileStore::open_or_create(config.clone())?;
        Ok(Self::new(Arc::new(store)))
    }
}

/// The relay service.
pub struct Relay {
    ctx: RelayContext,
    config: RelayConfig,
    mode: Arc<ModeCell>,
    scanner: Arc<RelationScanner>,
    registry: SubscriberRegistry,
    replay: ReplayEngine,
}

impl Relay {
    /// Resume from whatever the store already holds.
    pub fn new(ctx: RelayContext, config: RelayConfig) -> Result<Self> {
        let scanner = Arc::new(RelationScanner::open(ctx.store.clone(), ctx.bus.clone())?);
        let registry = SubscriberRegistry::new(ctx.store.clone());
        let replay = ReplayEngine::new(registry.clone(), scanner.clone());
        Ok(Self {
            ctx,
            config,
            mode: Arc::new(ModeCell::new()),
            scanner,
            registry,
            replay,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode.get()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.ctx.bus
    }

    pub fn scanner(&self) -> &Arc<RelationScanner> {
        &self.scanner
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Handle one live mention.
    ///
    /// A mention naming a feed identity registers the sender, and only once
    /// the record is durable are the identity's known facts emitted.
    /// Returns the number of facts emitted.
    pub fn handle_mention(&self, mention: &Mention) -> Result<usize> {
        self.ctx
            .bus
            .publish_mention(&mention.handle, mention.payload.clone());

        let identity = match mention.feed_identity.as_deref().map(str::trim) {
            Some(identity) if !identity.is_empty() => identity,
            _ => return Ok(0),
        };

        self.registry.register(&mention.handle, identity)?;
        self.scanner.emit_events_for(identity)
    }

    /// One replay pass. Errors end the pass but not the relay.
    pub fn replay_saved(&self) -> Option<ReplaySummary> {
        match self.replay.replay_all() {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!(event = "replay failed", error = %e);
                None
            }
        }
    }

    fn announce_live(&self, transition: Option<LiveTransition>) {
        match transition {
            Some(LiveTransition { target, cursor }) => {
                self.ctx.bus.publish_live(target, cursor);
                info!(event = "caught up", target = target.0, cursor = ?cursor);
            }
            None => debug!("mode was already live"),
        }
    }

    /// Run until a fatal error.
    ///
    /// The target is fetched before the feed is touched; if that fails the
    /// relay never starts scanning.
    pub async fn run(
        self,
        fetcher: &dyn TargetFetcher,
        source: Box<dyn ChangeSource>,
        mut sink: Box<dyn NotificationSink>,
    ) -> std::result::Result<(), RelayError> {
        let coordinator = CatchUpCoordinator::start(
            fetcher,
            &self.config.retry,
            self.mode.clone(),
            self.config.poll_interval,
        )
        .await?;

        info!(
            event = "backfill",
            target = coordinator.target().0,
            cursor = ?self.scanner.current_sequence(),
        );

        let mut scan: JoinHandle<std::result::Result<(), RelayError>> = tokio::spawn(follow(
            self.scanner.clone(),
            source,
            self.config.idle_interval,
            self.config.retry.clone(),
        ));

        let transition = tokio::select! {
            transition = coordinator.run(&*self.scanner) => transition,
            joined = &mut scan => return Err(scan_ended(joined)),
        };

        self.announce_live(transition);
        let mut mentions = sink.start_listening(&self.config.track_term()).await?;
        self.replay_saved();

        loop {
            tokio::select! {
                mention = mentions.recv() => match mention {
                    Some(mention) => {
                        self.handle_mention(&mention)?;
                    }
                    None => {
                        info!(event = "sink closed");
                        return Err(scan_ended((&mut scan).await));
                    }
                },
                joined = &mut scan => return Err(scan_ended(joined)),
            }
        }
    }
}

fn scan_ended(
    joined: std::result::Result<std::result::Result<(), RelayError>, tokio::task::JoinError>,
) -> RelayError {
    match joined {
        Ok(Err(e)) => e,
        Ok(Ok(())) => RelayError::Feed("change feed stopped".into()),
        Err(e) => RelayError::Feed(format!("scanner task failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventFilter, ListenerConfig, RelayEvent};
    use crate::kv::MemoryStore;
    use crate::scanner::Change;
    use crate::types::Sequence;
    use serde_json::json;

    fn change(seq: u64, name: &str, maintainer: &str, deps: &[&str]) -> Change {
        let deps: serde_json::Map<String, serde_json::Value> =
            deps.iter().map(|d| (d.to_string(), json!("*"))).collect();
        Change {
            seq: Sequence(seq),
            id: name.into(),
            deleted: false,
            doc: Some(json!({
                "name": name,
                "maintainers": [maintainer],
                "dist-tags": {"latest": "1.0.0"},
                "versions": {"1.0.0": {"dependencies": deps}},
            })),
        }
    }

    fn relay() -> Relay {
        let ctx = RelayContext::new(Arc::new(MemoryStore::new()));
        let config = RelayConfig {
            track_handle: "relaybot".into(),
            ..Default::default()
        };
        Relay::new(ctx, config).unwrap()
    }

    #[test]
    fn test_mention_registers_then_emits() {
        let relay = relay();
        relay.scanner().process(&change(1, "lib", "alice", &[])).unwrap();
        relay.scanner().process(&change(2, "app", "bob", &["lib"])).unwrap();

        let handle = relay.bus().subscribe(ListenerConfig::default());
        let mention = Mention {
            handle: "@alice_tw".into(),
            feed_identity: Some("alice".into()),
            payload: json!({"text": "hello"}),
        };
        assert_eq!(relay.handle_mention(&mention).unwrap(), 1);

        let record = relay.registry().get("@alice_tw").unwrap().unwrap();
        assert_eq!(record.feed_identity, "alice");

        let events = handle.drain();
        assert!(matches!(events[0], RelayEvent::Mention { .. }));
        assert!(matches!(events[1], RelayEvent::Dependency { ref user, .. } if user == "alice"));
    }

    #[test]
    fn test_mention_without_identity_only_publishes() {
        let relay = relay();
        let handle = relay.bus().subscribe(ListenerConfig {
            filter: EventFilter::relations(),
            ..Default::default()
        });
        let mention = Mention {
            handle: "@someone".into(),
            feed_identity: Some("  ".into()),
            payload: json!(null),
        };
        assert_eq!(relay.handle_mention(&mention).unwrap(), 0);
        assert_eq!(relay.registry().count().unwrap(), 0);
        assert!(handle.drain().is_empty());
    }

    #[test]
    fn test_replay_saved_reports_summary() {
        let relay = relay();
        relay.scanner().process(&change(1, "lib", "alice", &[])).unwrap();
        relay.scanner().process(&change(2, "app", "bob", &["lib"])).unwrap();
        relay.registry().register("@alice_tw", "alice").unwrap();
        relay.registry().register("@bob_tw", "bob").unwrap();

        let summary = relay.replay_saved().unwrap();
        assert_eq!(summary, ReplaySummary { subscribers: 2, facts: 1 });
        assert_eq!(relay.mode(), Mode::Backfill);
    }

    /// Records how many relation events were on the bus when listening began.
    struct OrderSink {
        bus: Arc<EventBus>,
        relations_at_start: Arc<parking_lot::Mutex<Option<usize>>>,
        keep_open: Option<tokio::sync::mpsc::Sender<Mention>>,
    }

    #[async_trait::async_trait]
    impl NotificationSink for OrderSink {
        async fn start_listening(
            &mut self,
            _track: &str,
        ) -> std::result::Result<tokio::sync::mpsc::Receiver<Mention>, RelayError> {
            let listener = self.bus.subscribe(ListenerConfig {
                filter: EventFilter::relations(),
                ..Default::default()
            });
            *self.relations_at_start.lock() = Some(listener.drain().len());
            let (tx, rx) = tokio::sync::mpsc::channel(1);
            self.keep_open = Some(tx);
            Ok(rx)
        }
    }

    struct AtTarget(Sequence);

    #[async_trait::async_trait]
    impl TargetFetcher for AtTarget {
        async fn fetch_target(&self) -> std::result::Result<Sequence, RelayError> {
            Ok(self.0)
        }
    }

    struct QuietFeed;

    #[async_trait::async_trait]
    impl ChangeSource for QuietFeed {
        async fn next_batch(
            &mut self,
            _since: Option<Sequence>,
        ) -> std::result::Result<crate::scanner::ChangeBatch, RelayError> {
            Ok(Default::default())
        }
    }

    #[tokio::test]
    async fn test_sink_starts_before_replay() {
        let relay = relay();
        relay.scanner().process(&change(1, "lib", "alice", &[])).unwrap();
        relay.scanner().process(&change(2, "app", "bob", &["lib"])).unwrap();
        relay.registry().register("@alice_tw", "alice").unwrap();

        let bus = relay.bus().clone();
        let replayed = bus.subscribe(ListenerConfig {
            filter: EventFilter::relations(),
            ..Default::default()
        });
        let relations_at_start = Arc::new(parking_lot::Mutex::new(None));
        let sink = OrderSink {
            bus: bus.clone(),
            relations_at_start: relations_at_start.clone(),
            keep_open: None,
        };

        let task = tokio::spawn(async move {
            relay
                .run(&AtTarget(Sequence(2)), Box::new(QuietFeed), Box::new(sink))
                .await
        });

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut events = Vec::new();
        while events.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "replay never ran");
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            events.extend(replayed.drain());
        }
        task.abort();

        assert_eq!(*relations_at_start.lock(), Some(0));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_relation().unwrap().user, "alice");
    }
}
