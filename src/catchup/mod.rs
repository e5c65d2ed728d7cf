//! Catch-up coordination.
//!
//! The coordinator learns the feed's position once at startup and then
//! watches the scanner's cursor. The first tick that sees the cursor at or
//! past that target flips the process from backfill to live. The flip
//! happens once per process: the poll timer is dropped with it.
//!
//! The target is never re-fetched. "Caught up" means every change that
//! existed at startup has been scanned, even if the feed kept growing.

mod target;

pub use target::{HttpTarget, TargetFetcher};

use crate::error::RelayError;
use crate::retry::RetryPolicy;
use crate::scanner::FactScanner;
use crate::types::{Mode, Sequence};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Process-wide mode flag. Moves from backfill to live at most once.
#[derive(Debug, Default)]
pub struct ModeCell {
    live: AtomicBool,
}

impl ModeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Mode {
        if self.live.load(Ordering::Acquire) {
            Mode::Live
        } else {
            Mode::Backfill
        }
    }

    /// Flip to live. Returns true only for the caller that made the flip.
    pub fn go_live(&self) -> bool {
        self.live
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Coordinator states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Waiting for the cursor to reach `target`.
    Polling { target: Sequence },
    /// Caught up. Terminal.
    Live { target: Sequence },
}

/// The edge that ended backfill.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveTransition {
    pub target: Sequence,
    /// Scanner position observed on the transitioning tick.
    pub cursor: Option<Sequence>,
}

/// Outcome of one poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Still behind the target.
    Behind,
    /// This tick made the transition.
    WentLive(LiveTransition),
    /// Already live; nothing to do.
    Idle,
}

/// Watches the scan cursor until it reaches the startup target.
pub struct CatchUpCoordinator {
    state: CoordinatorState,
    mode: Arc<ModeCell>,
    poll_interval: Duration,
}

impl CatchUpCoordinator {
    /// Coordinator for a known target.
    pub fn new(target: Sequence, mode: Arc<ModeCell>, poll_interval: Duration) -> Self {
        Self {
            state: CoordinatorState::Polling { target },
            mode,
            poll_interval,
        }
    }

    /// Fetch the target (with retries) and enter the polling state.
    ///
    /// Failure here is fatal to the process; there is nothing to catch up to.
    pub async fn start(
        fetcher: &dyn TargetFetcher,
        retry: &RetryPolicy,
        mode: Arc<ModeCell>,
        poll_interval: Duration,
    ) -> Result<Self, RelayError> {
        let target = retry
            .run("fetch target", || fetcher.fetch_target())
            .await?;
        info!(event = "target", target = target.0);
        Ok(Self::new(target, mode, poll_interval))
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn target(&self) -> Sequence {
        match self.state {
            CoordinatorState::Polling { target } | CoordinatorState::Live { target } => target,
        }
    }

    /// Compare `cursor` against the target once.
    pub fn tick(&mut self, cursor: Option<Sequence>) -> Tick {
        let target = match self.state {
            CoordinatorState::Polling { target } => target,
            CoordinatorState::Live { .. } => return Tick::Idle,
        };

        if !Sequence::reached(cursor, target) {
            debug!(cursor = ?cursor, target = target.0, "still catching up");
            return Tick::Behind;
        }

        self.state = CoordinatorState::Live { target };
        if self.mode.go_live() {
            Tick::WentLive(LiveTransition { target, cursor })
        } else {
            Tick::Idle
        }
    }

    /// Poll `scanner` on a timer until the transition happens.
    ///
    /// The first tick fires immediately. Returns `None` if the process was
    /// already live, which means someone else owns the transition.
    pub async fn run(mut self, scanner: &dyn FactScanner) -> Option<LiveTransition> {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            match self.tick(scanner.current_sequence()) {
                Tick::Behind => continue,
                Tick::WentLive(transition) => return Some(transition),
                Tick::Idle => return None,
            }
        }
    }
}
