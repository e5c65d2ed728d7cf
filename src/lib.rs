//! # Intervention Relay
//!
//! Follows a package registry's change feed, derives "who depends on your
//! package" relations, and tells subscribers about them.
//!
//! ## Core Concepts
//!
//! - **Cursor**: the last feed sequence fully processed, persisted so a
//!   restart resumes where it left off
//! - **Target**: the feed's position at startup; reaching it ends backfill
//! - **Subscribers**: durable `(channel handle, feed identity)` records
//! - **Replay**: once live, every known fact is re-emitted to every
//!   stored subscriber through the same path as fresh discoveries
//!
//! ## Example
//!
//! ```ignore
//! use intervention_relay::{Relay, RelayConfig, RelayContext, StoreConfig};
//!
//! let ctx = RelayContext::open(&StoreConfig {
//!     path: "./relay-db".into(),
//!     ..Default::default()
//! })?;
//! let relay = Relay::new(ctx, RelayConfig {
//!     track_handle: "relaybot".into(),
//!     ..Default::default()
//! })?;
//! relay.run(&fetcher, Box::new(source), Box::new(sink)).await?;
//! ```

pub mod bus;
pub mod catchup;
pub mod config;
pub mod cursor;
pub mod error;
pub mod kv;
pub mod logging;
pub mod registry;
pub mod relay;
pub mod replay;
pub mod retry;
pub mod scanner;
pub mod sink;
pub mod types;

// Re-exports
pub use bus::{DropReason, EventBus, EventFilter, ListenerConfig, ListenerHandle, RelayEvent};
pub use catchup::{
    CatchUpCoordinator, CoordinatorState, HttpTarget, LiveTransition, ModeCell, TargetFetcher,
    Tick,
};
pub use config::{Cli, RelayConfig};
pub use cursor::CursorState;
pub use error::{RelayError, Result, StoreError};
pub use kv::{FileStore, KvStore, MemoryStore, StoreConfig, StoreStats};
pub use registry::SubscriberRegistry;
pub use relay::{Relay, RelayContext};
pub use replay::{ReplayEngine, ReplaySummary};
pub use retry::RetryPolicy;
pub use scanner::{Change, ChangeBatch, ChangeSource, CouchChanges, FactScanner, RelationScanner};
pub use sink::{JsonLinesSink, Mention, NotificationSink};
pub use types::*;
