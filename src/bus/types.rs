//! Event bus types.

use crate::types::{Relation, RelationKind, Sequence};
use serde::{Deserialize, Serialize};

/// Configuration for a listener.
#[derive(Clone, Debug)]
pub struct ListenerConfig {
    /// Max buffered events before dropping the listener.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: EventFilter,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: EventFilter::all(),
        }
    }
}

/// Filter criteria for listeners.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only relations addressed to these users (None = all users).
    pub users: Option<Vec<String>>,

    /// Include dependency / devDependency events.
    pub include_relations: bool,

    /// Include mention events.
    pub include_mentions: bool,

    /// Include the live transition.
    pub include_lifecycle: bool,
}

impl EventFilter {
    /// Relations for every user.
    pub fn relations() -> Self {
        Self {
            include_relations: true,
            ..Default::default()
        }
    }

    /// Relations addressed to one user.
    pub fn for_user(user: impl Into<String>) -> Self {
        Self {
            users: Some(vec![user.into()]),
            include_relations: true,
            ..Default::default()
        }
    }

    /// Everything.
    pub fn all() -> Self {
        Self {
            users: None,
            include_relations: true,
            include_mentions: true,
            include_lifecycle: true,
        }
    }

    /// Whether `event` passes this filter.
    pub fn matches(&self, event: &RelayEvent) -> bool {
        match event {
            RelayEvent::Dependency { user, .. } | RelayEvent::DevDependency { user, .. } => {
                if !self.include_relations {
                    return false;
                }
                match self.users {
                    Some(ref users) => users.iter().any(|u| u == user),
                    None => true,
                }
            }
            RelayEvent::Mention { .. } => self.include_mentions,
            RelayEvent::Live { .. } => self.include_lifecycle,
            // Only ever sent directly to the listener being dropped
            RelayEvent::Dropped { .. } => false,
        }
    }
}

/// Events published on the bus.
///
/// Replayed relations are indistinguishable from freshly discovered ones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// `depending` lists `dependency` (maintained by `user`) in `dependencies`.
    Dependency {
        user: String,
        depending: String,
        dependency: String,
        sequence: Sequence,
    },

    /// `depending` lists `dependency` (maintained by `user`) in `devDependencies`.
    DevDependency {
        user: String,
        depending: String,
        dependency: String,
        sequence: Sequence,
    },

    /// A mention arrived on the notification channel.
    Mention {
        handle: String,
        payload: serde_json::Value,
    },

    /// Backfill reached the startup target; the relay is live.
    Live {
        target: Sequence,
        cursor: Option<Sequence>,
    },

    /// Listener was dropped.
    Dropped { reason: DropReason },
}

impl RelayEvent {
    /// Build the event for a relation.
    pub fn from_relation(relation: &Relation) -> Self {
        let Relation {
            kind,
            user,
            depending,
            dependency,
            sequence,
        } = relation.clone();
        match kind {
            RelationKind::Dependency => RelayEvent::Dependency {
                user,
                depending,
                dependency,
                sequence,
            },
            RelationKind::DevDependency => RelayEvent::DevDependency {
                user,
                depending,
                dependency,
                sequence,
            },
        }
    }

    /// Recover the relation carried by a relation event.
    pub fn as_relation(&self) -> Option<Relation> {
        let (kind, user, depending, dependency, sequence) = match self {
            RelayEvent::Dependency {
                user,
                depending,
                dependency,
                sequence,
            } => (RelationKind::Dependency, user, depending, dependency, sequence),
            RelayEvent::DevDependency {
                user,
                depending,
                dependency,
                sequence,
            } => (RelationKind::DevDependency, user, depending, dependency, sequence),
            _ => return None,
        };
        Some(Relation {
            kind,
            user: user.clone(),
            depending: depending.clone(),
            dependency: dependency.clone(),
            sequence: *sequence,
        })
    }
}

/// Why a listener was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Unique identifier for a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Handle to receive events.
pub struct ListenerHandle {
    pub id: ListenerId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<RelayEvent>,
}

impl ListenerHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<RelayEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<RelayEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<RelayEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered, without blocking.
    pub fn drain(&self) -> Vec<RelayEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(kind: RelationKind) -> Relation {
        Relation {
            kind,
            user: "alice".into(),
            depending: "app".into(),
            dependency: "lib".into(),
            sequence: Sequence(3),
        }
    }

    #[test]
    fn test_relation_event_roundtrip() {
        for kind in [RelationKind::Dependency, RelationKind::DevDependency] {
            let rel = relation(kind);
            assert_eq!(RelayEvent::from_relation(&rel).as_relation(), Some(rel));
        }
    }

    #[test]
    fn test_event_wire_shape() {
        let event = RelayEvent::from_relation(&relation(RelationKind::DevDependency));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "dev_dependency");
        assert_eq!(value["user"], "alice");
        assert_eq!(value["sequence"], 3);
    }

    #[test]
    fn test_filter_by_user() {
        let filter = EventFilter::for_user("bob");
        let event = RelayEvent::from_relation(&relation(RelationKind::Dependency));
        assert!(!filter.matches(&event));
        assert!(EventFilter::for_user("alice").matches(&event));
        assert!(!filter.matches(&RelayEvent::Live {
            target: Sequence(0),
            cursor: None
        }));
    }
}
