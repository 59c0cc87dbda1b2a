use async_trait::async_trait;
use crate::core::{AuxCommand, AuxDevice, AxisPositions, Pose, PoseTargets, DEFAULT_SECONDS_PER_STEP};
use crate::hardware::actuator::{
    Actuator, ActuatorError, ActuatorResult, AuxReport, Health, PoseReport, RemoteConfig,
};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A call received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorCall {
    Probe,
    SetPose(Pose),
    SetAux {
        device: AuxDevice,
        command: AuxCommand,
        intensity: Option<u8>,
    },
    PushConfig(RemoteConfig),
    Home,
}

/// A call and the (tokio) time it arrived
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call: ActuatorCall,
    pub at: Instant,
}

/// Mock controller for testing without hardware
///
/// Records every call, tracks arm positions and running flags like the real
/// controller, and can simulate travel time and failures. Also backs the
/// `--mock` dry-run mode of the CLI.
pub struct MockActuator {
    name: String,
    inner: Mutex<MockInner>,
}

struct MockInner {
    calls: Vec<RecordedCall>,
    positions: AxisPositions,
    targets: PoseTargets,
    /// Seconds per step when simulating travel, None for instant moves
    travel: Option<f64>,
    blower_running: bool,
    fogger_running: bool,
    reachable: bool,
    failing_poses: HashSet<Pose>,
    fail_aux: bool,
    probe_delay: Option<Duration>,
    config_delay: Option<Duration>,
    status: String,
}

impl MockActuator {
    /// Create a mock with instant moves, starting at the home pose
    pub fn new(name: &str) -> Self {
        let targets = PoseTargets::default();
        Self {
            name: name.to_string(),
            inner: Mutex::new(MockInner {
                calls: Vec::new(),
                positions: targets.get(Pose::HOME).unwrap_or_default(),
                targets,
                travel: None,
                blower_running: false,
                fogger_running: false,
                reachable: true,
                failing_poses: HashSet::new(),
                fail_aux: false,
                probe_delay: None,
                config_delay: None,
                status: "ok".to_string(),
            }),
        }
    }

    /// Simulate travel time at `seconds_per_step`
    pub fn with_travel(self, seconds_per_step: f64) -> Self {
        self.lock().travel = Some(seconds_per_step);
        self
    }

    /// Simulate travel at the default step rate
    pub fn with_default_travel(self) -> Self {
        self.with_travel(DEFAULT_SECONDS_PER_STEP)
    }

    pub fn with_targets(self, targets: PoseTargets) -> Self {
        self.lock().targets = targets;
        self
    }

    pub fn with_positions(self, positions: AxisPositions) -> Self {
        self.lock().positions = positions;
        self
    }

    /// Make every call fail as if the network were down
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make moves to `pose` fail
    pub fn fail_pose(&self, pose: Pose) {
        self.lock().failing_poses.insert(pose);
    }

    pub fn fail_aux(&self, fail: bool) {
        self.lock().fail_aux = fail;
    }

    /// Delay probe answers (for timeout tests)
    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        self.lock().probe_delay = delay;
    }

    /// Delay configuration pushes, like a controller busy writing its config
    pub fn set_config_delay(&self, delay: Option<Duration>) {
        self.lock().config_delay = delay;
    }

    /// Status string reported by probes
    pub fn set_status(&self, status: &str) {
        self.lock().status = status.to_string();
    }

    /// Current simulated arm positions
    pub fn positions(&self) -> AxisPositions {
        self.lock().positions
    }

    pub fn aux_running(&self, device: AuxDevice) -> bool {
        let inner = self.lock();
        match device {
            AuxDevice::Blower => inner.blower_running,
            AuxDevice::Fogger => inner.fogger_running,
        }
    }

    /// All calls received so far
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Drain recorded calls (for verification)
    pub fn take_calls(&self) -> Vec<RecordedCall> {
        std::mem::take(&mut self.lock().calls)
    }

    /// Pose commands with their arrival times
    pub fn pose_calls(&self) -> Vec<(Pose, Instant)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c.call {
                ActuatorCall::SetPose(pose) => Some((pose, c.at)),
                _ => None,
            })
            .collect()
    }

    /// Blower/fogger commands with their arrival times
    pub fn aux_calls(&self) -> Vec<(AuxDevice, AuxCommand, Instant)> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c.call {
                ActuatorCall::SetAux { device, command, .. } => Some((device, command, c.at)),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls matching `pred`
    pub fn count(&self, pred: impl Fn(&ActuatorCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(&c.call)).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: ActuatorCall) -> ActuatorResult<()> {
        let mut inner = self.lock();
        inner.calls.push(RecordedCall {
            call,
            at: Instant::now(),
        });
        if inner.reachable {
            Ok(())
        } else {
            Err(ActuatorError::Unavailable(format!("{} is unreachable", self.name)))
        }
    }

    /// Travel to `pose`, taking simulated time if configured
    ///
    /// A failing pose still spends its travel time, then reports the stall.
    async fn travel_to(&self, pose: Pose) -> ActuatorResult<PoseReport> {
        let (target, travel) = {
            let inner = self.lock();
            let target = inner
                .targets
                .get(pose)
                .ok_or_else(|| ActuatorError::Rejected(format!("no target for {}", pose)))?;
            let travel = inner
                .travel
                .map(|per_step| inner.positions.max_displacement(&target) as f64 * per_step)
                .unwrap_or(0.0);
            (target, travel)
        };

        if travel > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(travel)).await;
        }

        let mut inner = self.lock();
        if inner.failing_poses.contains(&pose) {
            return Err(ActuatorError::Rejected(format!("move to {} stalled", pose)));
        }
        inner.positions = target;
        drop(inner);
        debug!("Mock moved to {} in {:.3}s", pose, travel);
        Ok(PoseReport {
            state: Some(pose.as_str().to_string()),
            positions: Some(target),
            elapsed: Some(travel),
        })
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn probe(&self) -> ActuatorResult<Health> {
        self.record(ActuatorCall::Probe)?;
        let delay = self.lock().probe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.lock();
        Ok(Health {
            status: inner.status.clone(),
            positions: Some(inner.positions),
            blower_running: Some(inner.blower_running),
            fogger_running: Some(inner.fogger_running),
        })
    }

    async fn set_pose(&self, pose: Pose) -> ActuatorResult<PoseReport> {
        self.record(ActuatorCall::SetPose(pose))?;
        self.travel_to(pose).await
    }

    async fn set_aux(
        &self,
        device: AuxDevice,
        command: AuxCommand,
        intensity: Option<u8>,
    ) -> ActuatorResult<AuxReport> {
        self.record(ActuatorCall::SetAux {
            device,
            command,
            intensity,
        })?;
        let mut inner = self.lock();
        if inner.fail_aux {
            return Err(ActuatorError::Rejected(format!("{} did not respond", device)));
        }
        let running = command.running();
        match device {
            AuxDevice::Blower => inner.blower_running = running,
            AuxDevice::Fogger => inner.fogger_running = running,
        }
        Ok(AuxReport {
            running: Some(running),
        })
    }

    async fn push_config(&self, config: &RemoteConfig) -> ActuatorResult<()> {
        self.record(ActuatorCall::PushConfig(config.clone()))?;
        let delay = self.lock().config_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.lock().targets = config.positions.clone();
        Ok(())
    }

    async fn home(&self) -> ActuatorResult<PoseReport> {
        self.record(ActuatorCall::Home)?;
        self.travel_to(Pose::HOME).await
    }
}
