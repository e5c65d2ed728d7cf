//! Fact scanning.
//!
//! The scanner walks the registry change feed in sequence order, derives
//! dependency relations from package documents, persists them, and emits
//! them on the event bus. Its in-memory position is the cursor the catch-up
//! coordinator watches.

mod feed;
mod relations;

pub use feed::{follow, ChangeBatch, ChangeSource, CouchChanges};
pub use relations::{PackageInfo, RelationScanner};

use crate::error::Result;
use crate::types::Sequence;
use serde::Deserialize;

/// Source of derived facts.
pub trait FactScanner: Send + Sync {
    /// Highest feed sequence processed so far, `None` before the first change.
    fn current_sequence(&self) -> Option<Sequence>;

    /// Re-emit every known fact addressed to `identity` through the same
    /// path used for fresh discoveries. Returns the number of facts emitted.
    fn emit_events_for(&self, identity: &str) -> Result<usize>;
}

/// One entry of the change feed.
#[derive(Clone, Debug, Deserialize)]
pub struct Change {
    pub seq: Sequence,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    /// Raw package document. Only a handful of fields are ever read.
    #[serde(default)]
    pub doc: Option<serde_json::Value>,
}
