pub mod controller;
pub mod dispatcher;
pub mod engine;

pub use controller::{EngineSnapshot, RunController};
pub use dispatcher::{ActionDispatcher, DispatchError, DispatchOutcome};
pub use engine::{Player, PlayerStatus};

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerState {
    Idle,
    /// Reserved, waiting for the configuration push
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for PlayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PlayerState::Idle => "idle",
            PlayerState::Starting => "starting",
            PlayerState::Running => "running",
            PlayerState::Stopping => "stopping",
        };
        f.write_str(label)
    }
}

/// Playback configuration
#[derive(Debug, Clone)]
pub struct PlaybackConfig {
    /// Playhead refresh interval, also the shortest possible loop
    pub tick: Duration,
    /// Turn the blower on for the whole run
    pub blower_enabled: bool,
    /// Blower duty cycle in percent
    pub blower_speed: u8,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            blower_enabled: true,
            blower_speed: 100,
        }
    }
}

/// What to do with the arms when a run stops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Send the arms back to the home pose
    ReturnHome,
    /// Leave the arms where they are (a manual move follows, or the run aborted)
    SkipHome,
}

/// Errors starting a run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("a run is already {0}")]
    AlreadyRunning(PlayerState),

    #[error("the run was stopped before it started")]
    Cancelled,
}

/// Cancellation token minted for each run
///
/// Every timer armed for a run captures a clone. Cancelling is one-way, and a
/// fresh token is minted per run, so stale callbacks from an earlier run can
/// never act on a later one.
#[derive(Debug, Clone)]
pub struct RunToken {
    run_id: u64,
    cancelled: Arc<AtomicBool>,
}

impl RunToken {
    pub fn new(run_id: u64) -> Self {
        Self {
            run_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether `other` belongs to the same run
    pub fn same_run(&self, other: &RunToken) -> bool {
        self.run_id == other.run_id && Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_cancel_is_shared_between_clones() {
        let token = RunToken::new(7);
        let armed = token.clone();
        assert!(!armed.is_cancelled());
        token.cancel();
        assert!(armed.is_cancelled());
        assert!(armed.same_run(&token));
    }

    #[test]
    fn test_tokens_from_different_runs_differ() {
        let first = RunToken::new(1);
        let second = RunToken::new(2);
        first.cancel();
        assert!(!second.is_cancelled());
        assert!(!first.same_run(&second));
        // Same id but minted separately is still another run
        assert!(!RunToken::new(1).same_run(&first));
    }
}
