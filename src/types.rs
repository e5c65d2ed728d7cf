//! Core types for the relay.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position in the upstream change feed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }

    /// Whether this position has reached `target`.
    ///
    /// An absent cursor counts as the feed origin, so it satisfies a target of 0.
    pub fn reached(cursor: Option<Sequence>, target: Sequence) -> bool {
        cursor.unwrap_or_default() >= target
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Which dependency map a relation was found in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    Dependency,
    DevDependency,
}

impl RelationKind {
    /// Event name used in log lines.
    pub fn event_name(self) -> &'static str {
        match self {
            RelationKind::Dependency => "dependency",
            RelationKind::DevDependency => "devDependency",
        }
    }
}

/// A derived fact: `depending` declares `dependency`, which `user` maintains.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Relation {
    pub kind: RelationKind,
    pub user: String,
    pub depending: String,
    pub dependency: String,
    /// Feed position at which the relation was observed.
    pub sequence: Sequence,
}

/// A registered recipient of relation events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberRecord {
    /// Handle on the notification channel (e.g. a social-network username).
    pub channel_handle: String,
    /// Correlated identity in the feed's namespace (e.g. a registry username).
    pub feed_identity: String,
}

impl SubscriberRecord {
    pub fn new(channel_handle: impl Into<String>, feed_identity: impl Into<String>) -> Self {
        Self {
            channel_handle: channel_handle.into(),
            feed_identity: feed_identity.into(),
        }
    }
}

/// Process-wide relay mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Scanning historical feed entries up to the startup target.
    Backfill,
    /// Caught up; mentions are being processed as they arrive.
    Live,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Backfill
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_navigation() {
        let seq = Sequence(5);
        assert_eq!(seq.next(), Sequence(6));
        assert_eq!(seq.prev(), Some(Sequence(4)));
        assert_eq!(Sequence(0).prev(), None);
    }

    #[test]
    fn test_sequence_reached() {
        assert!(Sequence::reached(None, Sequence(0)));
        assert!(!Sequence::reached(None, Sequence(1)));
        assert!(Sequence::reached(Some(Sequence(500)), Sequence(500)));
        assert!(Sequence::reached(Some(Sequence(501)), Sequence(500)));
        assert!(!Sequence::reached(Some(Sequence(499)), Sequence(500)));
    }

    #[test]
    fn test_sequence_serializes_as_integer() {
        let encoded = serde_json::to_string(&Sequence(42)).unwrap();
        assert_eq!(encoded, "42");
    }

    #[test]
    fn test_relation_kind_event_names() {
        assert_eq!(RelationKind::Dependency.event_name(), "dependency");
        assert_eq!(RelationKind::DevDependency.event_name(), "devDependency");
    }
}
