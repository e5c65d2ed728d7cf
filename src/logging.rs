//! Log output.
//!
//! Filter priority, highest first:
//!
//! 1. `RELAY_LOG` (or `--log`)
//! 2. `RUST_LOG`
//! 3. `info`
//!
//! Every relay event is also written to the log by a drain listening on the
//! bus, so the log is the primary record of what the relay discovered.

use crate::bus::{DropReason, EventBus, ListenerConfig, ListenerHandle, RelayEvent};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Events buffered for the log drain before the bus drops it.
const DRAIN_BUFFER: usize = 65_536;

const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global subscriber. Call once, first thing in `main`.
///
/// `directives` is the `--log` value, which already includes `RELAY_LOG`.
pub fn init_subscriber(directives: Option<&str>, json: bool) {
    let filter = build_env_filter(directives);
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .init();
    }
}

/// Unparseable directives fall through to the next source.
fn build_env_filter(directives: Option<&str>) -> EnvFilter {
    if let Some(filter) = directives.and_then(|d| EnvFilter::try_new(d).ok()) {
        return filter;
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    EnvFilter::new(DEFAULT_DIRECTIVE)
}

/// Log every bus event from a blocking-pool thread.
pub fn spawn_event_logger(bus: &Arc<EventBus>) -> JoinHandle<()> {
    let drain = EventDrain::new(bus, DRAIN_BUFFER);
    tokio::task::spawn_blocking(move || drain.run(log_event))
}

/// A bus listener that survives being dropped for falling behind.
///
/// Overflow (or a lost listener) triggers a fresh subscription; events
/// published while the old listener was full are lost, later ones are not.
/// The drain ends when it is unsubscribed or the bus goes away.
pub struct EventDrain {
    bus: Weak<EventBus>,
    buffer_size: usize,
    handle: ListenerHandle,
    resubscribes: u64,
}

impl EventDrain {
    /// Subscribe now, so nothing published before `run` starts is missed.
    pub fn new(bus: &Arc<EventBus>, buffer_size: usize) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            buffer_size,
            handle: bus.subscribe(Self::config(buffer_size)),
            resubscribes: 0,
        }
    }

    fn config(buffer_size: usize) -> ListenerConfig {
        ListenerConfig {
            buffer_size,
            ..Default::default()
        }
    }

    /// Hand each event to `write` until the drain ends.
    pub fn run(mut self, mut write: impl FnMut(&RelayEvent)) {
        loop {
            match self.handle.recv() {
                Ok(RelayEvent::Dropped {
                    reason: DropReason::Unsubscribed,
                }) => return,
                Ok(RelayEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                })
                | Err(_) => {
                    if !self.resubscribe() {
                        return;
                    }
                }
                Ok(event) => write(&event),
            }
        }
    }

    fn resubscribe(&mut self) -> bool {
        let bus = match self.bus.upgrade() {
            Some(bus) => bus,
            None => return false,
        };
        self.handle = bus.subscribe(Self::config(self.buffer_size));
        self.resubscribes += 1;
        warn!(
            event = "log drain resubscribed",
            listener = self.handle.id.0,
            resubscribes = self.resubscribes,
        );
        true
    }
}

/// Write one event to the log.
pub fn log_event(event: &RelayEvent) {
    match event {
        RelayEvent::Dependency {
            user,
            depending,
            dependency,
            sequence,
        } => info!(
            event = "dependency",
            user = %user,
            depending = %depending,
            dependency = %dependency,
            sequence = sequence.0,
        ),
        RelayEvent::DevDependency {
            user,
            depending,
            dependency,
            sequence,
        } => info!(
            event = "devDependency",
            user = %user,
            depending = %depending,
            dependency = %dependency,
            sequence = sequence.0,
        ),
        RelayEvent::Mention { handle, payload } => {
            info!(event = "mention", handle = %handle, payload = %payload)
        }
        RelayEvent::Live { target, cursor } => {
            info!(event = "live", target = target.0, cursor = ?cursor)
        }
        RelayEvent::Dropped { reason } => {
            warn!(event = "listener dropped", reason = ?reason)
        }
    }
}
