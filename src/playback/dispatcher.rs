use crate::core::{Action, AuxCommand, AuxDevice, Pose, PoseTargets};
use crate::hardware::{Actuator, ActuatorError, RemoteConfig, SharedActuatorState};
use crate::playback::RunToken;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// How a dispatch ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The controller acknowledged the command
    Completed,
    /// The controller is offline; only the cached state was updated
    Skipped,
    /// The run was cancelled before or while the command was in flight
    Cancelled,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("move to {pose} failed: {source}")]
    Movement {
        pose: Pose,
        #[source]
        source: ActuatorError,
    },

    #[error("{device} {command} failed: {source}")]
    Aux {
        device: AuxDevice,
        command: AuxCommand,
        #[source]
        source: ActuatorError,
    },

    #[error("no target position configured for {0}")]
    UnresolvedPose(Pose),
}

/// Turns actions into controller calls and keeps the cached state in step
///
/// Movement updates the cached axes to the resolved target as soon as the
/// command goes out, so the next estimate starts from where the arms are
/// heading rather than where they were.
#[derive(Clone)]
pub struct ActionDispatcher {
    actuator: Arc<dyn Actuator>,
    state: SharedActuatorState,
}

impl ActionDispatcher {
    pub fn new(actuator: Arc<dyn Actuator>, state: SharedActuatorState) -> Self {
        Self { actuator, state }
    }

    pub fn state(&self) -> &SharedActuatorState {
        &self.state
    }

    pub fn actuator(&self) -> &Arc<dyn Actuator> {
        &self.actuator
    }

    /// Dispatch one action
    ///
    /// With a run token, nothing happens once the token is cancelled and a
    /// response arriving after cancellation is discarded.
    pub async fn dispatch(
        &self,
        action: &Action,
        targets: &PoseTargets,
        token: Option<&RunToken>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if is_cancelled(token) {
            return Ok(DispatchOutcome::Cancelled);
        }

        match action {
            Action::Movement { pose } => self.move_to(*pose, targets, token).await,
            Action::Blower { command, intensity } => {
                self.set_aux(AuxDevice::Blower, *command, *intensity, token).await
            }
            Action::Fogger { command, intensity } => {
                self.set_aux(AuxDevice::Fogger, *command, *intensity, token).await
            }
        }
    }

    async fn move_to(
        &self,
        pose: Pose,
        targets: &PoseTargets,
        token: Option<&RunToken>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let target = targets.get(pose).ok_or(DispatchError::UnresolvedPose(pose))?;
        self.state.set_commanded_pose(pose, target);

        if !self.state.is_online() {
            debug!("Offline, not sending move {}", pose);
            return Ok(DispatchOutcome::Skipped);
        }

        debug!("Sending move {}", pose);
        let result = self.actuator.set_pose(pose).await;

        // The world may have changed while the arms were moving
        if is_cancelled(token) {
            debug!("Move {} finished after cancellation", pose);
            return Ok(DispatchOutcome::Cancelled);
        }

        let report = result.map_err(|source| DispatchError::Movement { pose, source })?;
        if let Some(positions) = report.positions {
            self.state.apply_positions(positions);
        }
        if let Some(elapsed) = report.elapsed {
            debug!("Move {} took {:.2}s", pose, elapsed);
        }
        Ok(DispatchOutcome::Completed)
    }

    async fn set_aux(
        &self,
        device: AuxDevice,
        command: AuxCommand,
        intensity: Option<u8>,
        token: Option<&RunToken>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.state.set_aux_running(device, command.running());

        if !self.state.is_online() {
            debug!("Offline, not sending {} {}", device, command);
            return Ok(DispatchOutcome::Skipped);
        }

        debug!("Sending {} {}", device, command);
        let result = self.actuator.set_aux(device, command, intensity).await;

        if is_cancelled(token) {
            return Ok(DispatchOutcome::Cancelled);
        }

        let report = result.map_err(|source| DispatchError::Aux {
            device,
            command,
            source,
        })?;
        if let Some(running) = report.running {
            self.state.set_aux_running(device, running);
        }
        Ok(DispatchOutcome::Completed)
    }

    /// Send the arms home (not tied to any run)
    pub async fn return_home(&self, targets: &PoseTargets) -> Result<DispatchOutcome, DispatchError> {
        let home = targets
            .get(Pose::HOME)
            .ok_or(DispatchError::UnresolvedPose(Pose::HOME))?;
        self.state.set_homed(home);

        if !self.state.is_online() {
            debug!("Offline, not sending home");
            return Ok(DispatchOutcome::Skipped);
        }

        let report = self.actuator.home().await.map_err(|source| DispatchError::Movement {
            pose: Pose::HOME,
            source,
        })?;
        if let Some(positions) = report.positions {
            self.state.apply_positions(positions);
        }
        Ok(DispatchOutcome::Completed)
    }

    /// Push timing and position configuration; failures are logged only
    pub async fn push_config(&self, config: &RemoteConfig) -> bool {
        if !self.state.is_online() {
            debug!("Offline, not pushing configuration");
            return false;
        }
        match self.actuator.push_config(config).await {
            Ok(()) => {
                info!("Configuration pushed to {}", self.actuator.name());
                true
            }
            Err(e) => {
                warn!("Configuration push to {} failed: {}", self.actuator.name(), e);
                false
            }
        }
    }
}

fn is_cancelled(token: Option<&RunToken>) -> bool {
    token.is_some_and(RunToken::is_cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{AxisPositions, MotionProfile};
    use crate::hardware::{ActuatorCall, ConnectivityMonitor, MockActuator};
    use std::time::Duration;

    async fn online(mock: Arc<MockActuator>) -> (ActionDispatcher, SharedActuatorState) {
        let state = SharedActuatorState::default();
        let monitor = ConnectivityMonitor::new(
            mock.clone(),
            state.clone(),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        assert!(monitor.probe_once().await);
        (ActionDispatcher::new(mock, state.clone()), state)
    }

    #[tokio::test(start_paused = true)]
    async fn test_position_updates_on_dispatch_not_on_response() {
        let mock = Arc::new(MockActuator::new("pi").with_default_travel());
        let (dispatcher, state) = online(mock.clone()).await;
        let profile = MotionProfile::default();
        assert_eq!(state.positions(), AxisPositions::new(400, 400));

        let first = {
            let dispatcher = dispatcher.clone();
            let targets = profile.targets.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&Action::movement(Pose::Close), &targets, None)
                    .await
            })
        };

        // 10 ms later the 800 ms move is still in flight
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(state.positions(), AxisPositions::new(0, 0));

        // Next block's estimate starts from CLOSE, not from OPEN
        let estimate = profile.estimate(&Action::movement(Pose::Dip), &state.positions());
        assert!((estimate - 0.4).abs() < 1e-9);

        assert_eq!(first.await.unwrap().unwrap(), DispatchOutcome::Completed);
        assert_eq!(mock.positions(), AxisPositions::new(0, 0));
    }

    #[tokio::test]
    async fn test_offline_dispatch_updates_cache_only() {
        let mock = Arc::new(MockActuator::new("pi"));
        let state = SharedActuatorState::default();
        let dispatcher = ActionDispatcher::new(mock.clone(), state.clone());
        let targets = PoseTargets::default();

        let outcome = dispatcher
            .dispatch(&Action::movement(Pose::Dip), &targets, None)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert_eq!(state.positions(), AxisPositions::new(-200, -200));

        let outcome = dispatcher
            .dispatch(&Action::aux(AuxDevice::Fogger, AuxCommand::Start, None), &targets, None)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Skipped);
        assert!(state.snapshot().fogger_running);

        assert!(!dispatcher.push_config(&sample_config()).await);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_is_a_no_op() {
        let mock = Arc::new(MockActuator::new("pi"));
        let (dispatcher, state) = online(mock.clone()).await;
        let token = RunToken::new(1);
        token.cancel();

        let outcome = dispatcher
            .dispatch(&Action::movement(Pose::Dip), &PoseTargets::default(), Some(&token))
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Cancelled);
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::SetPose(_))), 0);
        assert_eq!(state.positions(), AxisPositions::new(400, 400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_move_discards_result() {
        let mock = Arc::new(MockActuator::new("pi").with_default_travel());
        let (dispatcher, _) = online(mock.clone()).await;
        mock.fail_pose(Pose::Close);
        let token = RunToken::new(1);

        let task = {
            let dispatcher = dispatcher.clone();
            let token = token.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&Action::movement(Pose::Close), &PoseTargets::default(), Some(&token))
                    .await
            })
        };
        tokio::task::yield_now().await;
        token.cancel();

        // The failure is not reported once the run is gone
        assert!(matches!(task.await.unwrap(), Ok(DispatchOutcome::Cancelled)));
    }

    #[tokio::test]
    async fn test_failures_are_typed() {
        let mock = Arc::new(MockActuator::new("pi"));
        let (dispatcher, _) = online(mock.clone()).await;
        mock.fail_pose(Pose::Dip);
        mock.fail_aux(true);
        let targets = PoseTargets::default();

        let err = dispatcher
            .dispatch(&Action::movement(Pose::Dip), &targets, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Movement { pose: Pose::Dip, .. }));

        let err = dispatcher
            .dispatch(&Action::aux(AuxDevice::Blower, AuxCommand::Start, Some(80)), &targets, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Aux { device: AuxDevice::Blower, .. }));

        let mut partial = PoseTargets::default();
        partial.remove(Pose::Close);
        let err = dispatcher
            .dispatch(&Action::movement(Pose::Close), &partial, None)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnresolvedPose(Pose::Close)));
    }

    #[tokio::test]
    async fn test_return_home_and_push_config() {
        let mock = Arc::new(MockActuator::new("pi"));
        let (dispatcher, state) = online(mock.clone()).await;
        let targets = PoseTargets::default();

        dispatcher
            .dispatch(&Action::movement(Pose::Dip), &targets, None)
            .await
            .unwrap();
        assert_eq!(state.snapshot().last_pose, Some(Pose::Dip));

        let outcome = dispatcher.return_home(&targets).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(state.snapshot().last_pose, None);
        assert_eq!(state.positions(), AxisPositions::new(400, 400));
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Home)), 1);

        assert!(dispatcher.push_config(&sample_config()).await);
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::PushConfig(_))), 1);
    }

    fn sample_config() -> RemoteConfig {
        RemoteConfig {
            dip_duration: 5.0,
            lift_duration: 4.0,
            blow_duration: 3.0,
            close_duration: 1.5,
            fan_speed: 100,
            fan_enabled: true,
            step_delay: 0.002,
            positions: PoseTargets::default(),
        }
    }
}
