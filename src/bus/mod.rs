//! In-process event bus.
//!
//! Everything observable about the relay flows through here:
//! - Relation facts (dependency / devDependency), live or replayed
//! - Mentions received from the notification sink
//! - The backfill -> live transition
//!
//! Listeners get a bounded channel and may filter by event kind or by the
//! user a relation is addressed to. A listener that falls behind is dropped.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! let handle = bus.subscribe(ListenerConfig {
//!     filter: EventFilter::for_user("alice_npm"),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(RelayEvent::Dependency { depending, .. }) => println!("{} depends on you", depending),
//!         Ok(RelayEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::EventBus;
pub use types::{
    DropReason, EventFilter, ListenerConfig, ListenerHandle, ListenerId, RelayEvent,
};
