use crate::core::action::{Action, AuxCommand, AuxDevice, Pose, TrackKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Stable identity of a block for the lifetime of its timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(Uuid);

impl BlockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell blocks apart in logs
        let text = self.0.simple().to_string();
        f.write_str(&text[..8])
    }
}

/// A single schedulable action on a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionBlock {
    #[serde(default)]
    pub id: BlockId,

    /// What the block does
    #[serde(flatten)]
    pub action: Action,

    /// Offset from loop start, in seconds
    #[serde(rename = "start")]
    pub start_s: f64,

    /// Duration in seconds. For movement blocks this is the hold after the
    /// move completes, not the travel itself.
    #[serde(rename = "duration", default)]
    pub duration_s: f64,
}

impl ActionBlock {
    pub fn new(action: Action, start_s: f64, duration_s: f64) -> Self {
        Self {
            id: BlockId::new(),
            action,
            start_s,
            duration_s,
        }
    }

    /// Movement to `pose` at `start_s`, holding for `hold_s` afterwards
    pub fn movement(pose: Pose, start_s: f64, hold_s: f64) -> Self {
        Self::new(Action::movement(pose), start_s, hold_s)
    }

    pub fn blower(command: AuxCommand, start_s: f64, duration_s: f64) -> Self {
        Self::new(Action::aux(AuxDevice::Blower, command, None), start_s, duration_s)
    }

    pub fn fogger(command: AuxCommand, start_s: f64, duration_s: f64) -> Self {
        Self::new(Action::aux(AuxDevice::Fogger, command, None), start_s, duration_s)
    }

    /// Set the intensity payload (ignored for movement blocks)
    pub fn with_intensity(mut self, value: u8) -> Self {
        match &mut self.action {
            Action::Blower { intensity, .. } | Action::Fogger { intensity, .. } => *intensity = Some(value),
            Action::Movement { .. } => {}
        }
        self
    }

    pub fn kind(&self) -> TrackKind {
        self.action.kind()
    }

    /// Start offset as a duration (zero for invalid offsets)
    pub fn start(&self) -> Duration {
        Duration::try_from_secs_f64(self.start_s).unwrap_or_default()
    }
}
