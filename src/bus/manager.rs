//! Listener registry and broadcast.

use crate::types::{Relation, Sequence};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

use super::types::{DropReason, ListenerConfig, ListenerHandle, ListenerId, RelayEvent};

/// Internal listener state.
struct Listener {
    config: ListenerConfig,
    sender: Sender<RelayEvent>,
}

impl Listener {
    /// Try to send an event. Returns false if the buffer is full or the
    /// receiver is gone (listener will be dropped).
    fn try_send(&self, event: RelayEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }
}

/// Broadcasts relay events to listeners.
pub struct EventBus {
    /// Active listeners by ID.
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    /// Counter for generating listener IDs.
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener and return its receiving end.
    pub fn subscribe(&self, config: ListenerConfig) -> ListenerHandle {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        self.listeners
            .write()
            .insert(id, Listener { config, sender });

        ListenerHandle { id, receiver }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: ListenerId) {
        if let Some(listener) = self.listeners.write().remove(&id) {
            let _ = listener.sender.try_send(RelayEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    // --- Publishing ---

    /// Publish a relation fact. Live discovery and replay both come through here.
    pub fn publish_relation(&self, relation: &Relation) {
        self.publish(RelayEvent::from_relation(relation));
    }

    /// Publish a received mention.
    pub fn publish_mention(&self, handle: &str, payload: serde_json::Value) {
        self.publish(RelayEvent::Mention {
            handle: handle.to_string(),
            payload,
        });
    }

    /// Publish the backfill -> live edge.
    pub fn publish_live(&self, target: Sequence, cursor: Option<Sequence>) {
        self.publish(RelayEvent::Live { target, cursor });
    }

    /// Deliver to every matching listener. Drops listeners that can't keep up.
    pub fn publish(&self, event: RelayEvent) {
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                if listener.config.filter.matches(&event) && !listener.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut listeners = self.listeners.write();
            for id in to_remove {
                if let Some(listener) = listeners.remove(&id) {
                    warn!(event = "listener dropped", listener = id.0, reason = "buffer overflow");
                    let _ = listener.sender.try_send(RelayEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
