//! Arm geometry and travel-time estimation
//!
//! Both steppers move in lock-step at a fixed step rate, so the time a move
//! takes is bounded by whichever axis has the furthest to travel.

use crate::core::action::{Action, Pose};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seconds per motor step (1 ms high + 1 ms low pulse on the controller)
pub const DEFAULT_SECONDS_PER_STEP: f64 = 0.002;

/// Position of each arm axis, in motor steps from the closed position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AxisPositions {
    pub left: i32,
    pub right: i32,
}

impl AxisPositions {
    pub const fn new(left: i32, right: i32) -> Self {
        Self { left, right }
    }

    /// Largest absolute per-axis distance to `other`, in steps
    pub fn max_displacement(&self, other: &AxisPositions) -> u32 {
        let left = (self.left as i64 - other.left as i64).unsigned_abs();
        let right = (self.right as i64 - other.right as i64).unsigned_abs();
        left.max(right).min(u32::MAX as u64) as u32
    }
}

/// Target axis positions for each named pose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoseTargets(BTreeMap<Pose, AxisPositions>);

impl PoseTargets {
    /// No pose has a target
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, pose: Pose) -> Option<AxisPositions> {
        self.0.get(&pose).copied()
    }

    pub fn set(&mut self, pose: Pose, target: AxisPositions) {
        self.0.insert(pose, target);
    }

    pub fn remove(&mut self, pose: Pose) -> Option<AxisPositions> {
        self.0.remove(&pose)
    }

    pub fn contains(&self, pose: Pose) -> bool {
        self.0.contains_key(&pose)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Pose, AxisPositions)> + '_ {
        self.0.iter().map(|(pose, target)| (*pose, *target))
    }
}

impl Default for PoseTargets {
    fn default() -> Self {
        let mut targets = Self::empty();
        targets.set(Pose::Open, AxisPositions::new(400, 400));
        targets.set(Pose::Close, AxisPositions::new(0, 0));
        targets.set(Pose::Dip, AxisPositions::new(-200, -200));
        targets
    }
}

/// Step rate and pose targets of the arm mechanism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MotionProfile {
    pub seconds_per_step: f64,
    pub targets: PoseTargets,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            seconds_per_step: DEFAULT_SECONDS_PER_STEP,
            targets: PoseTargets::default(),
        }
    }
}

impl MotionProfile {
    /// Target positions for a movement action, if it resolves
    pub fn resolve(&self, action: &Action) -> Option<AxisPositions> {
        action.pose().and_then(|pose| self.targets.get(pose))
    }

    /// Expected travel time of `action` starting from `current`, in seconds
    pub fn estimate(&self, action: &Action, current: &AxisPositions) -> f64 {
        estimate_movement_duration(action, current, &self.targets, self.seconds_per_step)
    }
}

/// Expected wall-clock duration of a movement action, in seconds
///
/// Resolves the action's pose to its target positions, takes the largest
/// per-axis displacement from `current` and multiplies it by the per-step
/// cost. Non-movement actions and poses with no configured target yield 0;
/// the timeline rejects the latter before they can be scheduled.
pub fn estimate_movement_duration(
    action: &Action,
    current: &AxisPositions,
    targets: &PoseTargets,
    seconds_per_step: f64,
) -> f64 {
    let Some(target) = action.pose().and_then(|pose| targets.get(pose)) else {
        return 0.0;
    };
    if !seconds_per_step.is_finite() || seconds_per_step <= 0.0 {
        return 0.0;
    }
    current.max_displacement(&target) as f64 * seconds_per_step
}
