//! Cached view of the remote controller
//!
//! The controller is the source of truth. This cache is refreshed by the
//! connectivity monitor (the only writer of the online flag) and updated
//! optimistically by the dispatcher as commands go out.

use crate::core::{AuxDevice, AxisPositions, Pose};
use crate::hardware::actuator::Health;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};

/// Last known actuator state
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActuatorState {
    pub online: bool,
    pub positions: AxisPositions,
    pub blower_running: bool,
    pub fogger_running: bool,
    /// Last pose commanded (None once the machine is back to idle)
    pub last_pose: Option<Pose>,
    /// Time of the last successful probe
    pub last_seen: Option<DateTime<Utc>>,
}

impl ActuatorState {
    pub fn aux_running(&self, device: AuxDevice) -> bool {
        match device {
            AuxDevice::Blower => self.blower_running,
            AuxDevice::Fogger => self.fogger_running,
        }
    }
}

/// Shared handle to the cached state
///
/// The lock is only ever held for a field update, never across an await.
#[derive(Debug, Clone, Default)]
pub struct SharedActuatorState {
    inner: Arc<RwLock<ActuatorState>>,
}

impl SharedActuatorState {
    pub fn new(initial: ActuatorState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> ActuatorState {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_online(&self) -> bool {
        self.read(|s| s.online)
    }

    pub fn positions(&self) -> AxisPositions {
        self.read(|s| s.positions)
    }

    /// Record a pose as commanded, moving the cached axes to its target
    pub fn set_commanded_pose(&self, pose: Pose, target: AxisPositions) {
        self.write(|s| {
            s.last_pose = Some(pose);
            s.positions = target;
        });
    }

    /// Arms are back home and the machine is idle
    pub fn set_homed(&self, target: AxisPositions) {
        self.write(|s| {
            s.last_pose = None;
            s.positions = target;
        });
    }

    /// Positions reported by the controller after a move
    pub fn apply_positions(&self, positions: AxisPositions) {
        self.write(|s| s.positions = positions);
    }

    pub fn set_aux_running(&self, device: AuxDevice, running: bool) {
        self.write(|s| match device {
            AuxDevice::Blower => s.blower_running = running,
            AuxDevice::Fogger => s.fogger_running = running,
        });
    }

    /// Merge a successful probe; returns true if the actuator just came online
    pub(crate) fn apply_health(&self, health: &Health) -> bool {
        self.write(|s| {
            let was_online = s.online;
            s.online = true;
            s.last_seen = Some(Utc::now());
            if let Some(positions) = health.positions {
                s.positions = positions;
            }
            if let Some(running) = health.blower_running {
                s.blower_running = running;
            }
            if let Some(running) = health.fogger_running {
                s.fogger_running = running;
            }
            !was_online
        })
    }

    /// Mark the actuator unreachable; returns true if it was online
    pub(crate) fn mark_offline(&self) -> bool {
        self.write(|s| std::mem::replace(&mut s.online, false))
    }

    fn read<T>(&self, f: impl FnOnce(&ActuatorState) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&*guard)
    }

    fn write<T>(&self, f: impl FnOnce(&mut ActuatorState) -> T) -> T {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_merges_only_present_fields() {
        let state = SharedActuatorState::new(ActuatorState {
            positions: AxisPositions::new(10, 10),
            fogger_running: true,
            ..Default::default()
        });

        let came_online = state.apply_health(&Health {
            status: "ok".to_string(),
            positions: None,
            blower_running: Some(true),
            fogger_running: None,
        });

        assert!(came_online);
        let snap = state.snapshot();
        assert!(snap.online);
        assert!(snap.last_seen.is_some());
        assert_eq!(snap.positions, AxisPositions::new(10, 10));
        assert!(snap.blower_running);
        assert!(snap.fogger_running);

        // Second probe is not a transition
        assert!(!state.apply_health(&Health {
            status: "ok".to_string(),
            ..Default::default()
        }));
    }

    #[test]
    fn test_mark_offline_reports_transition() {
        let state = SharedActuatorState::default();
        assert!(!state.mark_offline());
        state.apply_health(&Health {
            status: "ok".to_string(),
            ..Default::default()
        });
        assert!(state.mark_offline());
        assert!(!state.is_online());
    }

    #[test]
    fn test_commanded_pose_and_home() {
        let state = SharedActuatorState::default();
        state.set_commanded_pose(Pose::Dip, AxisPositions::new(-200, -200));
        assert_eq!(state.snapshot().last_pose, Some(Pose::Dip));
        assert_eq!(state.positions(), AxisPositions::new(-200, -200));

        state.set_homed(AxisPositions::new(400, 400));
        assert_eq!(state.snapshot().last_pose, None);
        assert_eq!(state.positions(), AxisPositions::new(400, 400));
    }

    #[test]
    fn test_aux_flags() {
        let state = SharedActuatorState::default();
        state.set_aux_running(AuxDevice::Fogger, true);
        let snap = state.snapshot();
        assert!(snap.aux_running(AuxDevice::Fogger));
        assert!(!snap.aux_running(AuxDevice::Blower));
    }
}
