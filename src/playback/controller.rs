use crate::core::{Action, AxisPositions, Timeline};
use crate::hardware::{ActuatorState, RemoteConfig};
use crate::playback::dispatcher::{ActionDispatcher, DispatchError, DispatchOutcome};
use crate::playback::engine::Player;
use crate::playback::{PlaybackConfig, PlayerState, RunError, StopMode};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};

/// Owned view of the engine for display
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    /// `IDLE`, `STARTING`, `RUNNING`, `STOPPING` or the last commanded pose
    pub machine_state: String,
    pub player_state: PlayerState,
    pub running: bool,
    /// Seconds into the current iteration
    pub playhead: f64,
    pub loop_duration: f64,
    pub iteration: u64,
    pub online: bool,
    pub positions: AxisPositions,
    pub blower_running: bool,
    pub fogger_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Front door of the engine: start, stop, manual control and snapshots
#[derive(Clone)]
pub struct RunController {
    player: Player,
    remote: RemoteConfig,
}

impl RunController {
    pub fn new(
        dispatcher: ActionDispatcher,
        timeline: Timeline,
        config: PlaybackConfig,
        remote: RemoteConfig,
    ) -> Self {
        Self {
            player: Player::new(dispatcher, Arc::new(RwLock::new(timeline)), config),
            remote,
        }
    }

    /// Push configuration to the controller (best effort), then start playing
    ///
    /// A stop issued while the push is in flight wins: the run never starts
    /// and this returns [`RunError::Cancelled`].
    pub async fn start(&self) -> Result<(), RunError> {
        let token = self.player.begin()?;
        self.player.dispatcher().push_config(&self.remote_config()).await;
        self.player.launch(&token)
    }

    /// Stop the run and send the arms home; false if nothing was running
    pub async fn stop(&self) -> bool {
        self.player.stop(StopMode::ReturnHome).await
    }

    /// Stop any run, then perform a single action by hand
    ///
    /// A manual move skips the home return, since the arms are about to
    /// move anyway.
    pub async fn manual_override(&self, action: Action) -> Result<DispatchOutcome, DispatchError> {
        let mode = if action.is_movement() {
            StopMode::SkipHome
        } else {
            StopMode::ReturnHome
        };
        if self.player.stop(mode).await {
            info!("Run stopped for manual control");
        }

        info!("Manual {}", action);
        let targets = self.read_timeline(|t| t.motion_profile().targets.clone());
        let result = self.player.dispatcher().dispatch(&action, &targets, None).await;
        if let Err(e) = &result {
            warn!("Manual {} failed: {}", action, e);
        }
        result
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let status = self.player.status();
        let cached = self.player.dispatcher().state().snapshot();
        let loop_duration = self.read_timeline(Timeline::loop_duration);

        EngineSnapshot {
            machine_state: machine_state(status.state, &cached),
            player_state: status.state,
            running: status.state == PlayerState::Running,
            playhead: status.playhead.as_secs_f64(),
            loop_duration,
            iteration: status.iteration,
            online: cached.online,
            positions: cached.positions,
            blower_running: cached.blower_running,
            fogger_running: cached.fogger_running,
            last_error: status.last_error,
        }
    }

    /// Copy of the current timeline
    pub fn timeline(&self) -> Timeline {
        self.read_timeline(Timeline::clone)
    }

    /// Edit the timeline; while running, changes apply from the next iteration
    pub fn edit_timeline<R>(&self, f: impl FnOnce(&mut Timeline) -> R) -> R {
        let mut timeline = self.player.timeline().write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *timeline)
    }

    /// Configuration pushed before each run, with the timeline's motion profile
    pub fn remote_config(&self) -> RemoteConfig {
        let mut remote = self.remote.clone();
        self.read_timeline(|t| {
            remote.positions = t.motion_profile().targets.clone();
            remote.step_delay = t.motion_profile().seconds_per_step;
        });
        remote
    }

    pub fn player(&self) -> &Player {
        &self.player
    }

    fn read_timeline<R>(&self, f: impl FnOnce(&Timeline) -> R) -> R {
        let timeline = self.player.timeline().read().unwrap_or_else(PoisonError::into_inner);
        f(&*timeline)
    }
}

fn machine_state(player: PlayerState, cached: &ActuatorState) -> String {
    let label = match (player, cached.last_pose) {
        (PlayerState::Stopping, _) => "STOPPING",
        (_, Some(pose)) => pose.as_str(),
        (PlayerState::Starting, None) => "STARTING",
        (PlayerState::Running, None) => "RUNNING",
        (PlayerState::Idle, None) => "IDLE",
    };
    label.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionBlock, AuxCommand, AuxDevice, MotionProfile, Pose, PoseTargets, FOGGER_TRACK, MOTORS_TRACK};
    use crate::hardware::{ActuatorCall, ConnectivityMonitor, MockActuator, SharedActuatorState};
    use std::time::Duration;
    use tokio::time::sleep;

    fn remote() -> RemoteConfig {
        RemoteConfig {
            dip_duration: 5.0,
            lift_duration: 4.0,
            blow_duration: 3.0,
            close_duration: 1.5,
            fan_speed: 100,
            fan_enabled: false,
            step_delay: 0.002,
            positions: PoseTargets::default(),
        }
    }

    async fn controller(mock: &Arc<MockActuator>) -> RunController {
        let state = SharedActuatorState::default();
        let monitor = ConnectivityMonitor::new(
            mock.clone(),
            state.clone(),
            Duration::from_secs(2),
            Duration::from_secs(1),
        );
        assert!(monitor.probe_once().await);
        mock.take_calls();

        let mut timeline = Timeline::with_default_tracks(MotionProfile::default());
        timeline
            .insert_block(MOTORS_TRACK, ActionBlock::movement(Pose::Dip, 0.0, 1.0))
            .unwrap();
        timeline
            .insert_block(FOGGER_TRACK, ActionBlock::fogger(AuxCommand::Start, 0.5, 0.5))
            .unwrap();

        let config = PlaybackConfig {
            blower_enabled: false,
            ..Default::default()
        };
        RunController::new(ActionDispatcher::new(mock.clone(), state), timeline, config, remote())
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_pushes_config_then_runs() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;

        controller.start().await.unwrap();
        assert_eq!(
            controller.start().await,
            Err(RunError::AlreadyRunning(PlayerState::Running))
        );
        sleep(Duration::from_millis(750)).await;

        let calls: Vec<ActuatorCall> = mock.calls().into_iter().map(|c| c.call).collect();
        assert!(matches!(calls[0], ActuatorCall::PushConfig(_)));
        assert_eq!(calls[1], ActuatorCall::SetPose(Pose::Dip));
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::PushConfig(_))), 1);

        let snap = controller.snapshot();
        assert!(snap.running);
        assert_eq!(snap.machine_state, "DIP");
        assert!(snap.fogger_running);
        assert!((snap.playhead - 0.7).abs() < 1e-9);
        // 600 steps down to DIP plus the 1 s hold
        assert!((snap.loop_duration - 2.2).abs() < 1e-9);

        assert!(controller.stop().await);
        let snap = controller.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.machine_state, "IDLE");
        assert_eq!(snap.playhead, 0.0);
        assert!(!snap.fogger_running);
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Home)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_config_push_cancels_start() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;
        mock.set_config_delay(Some(Duration::from_millis(500)));

        let starting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start().await }
        });
        sleep(Duration::from_millis(100)).await;

        let snap = controller.snapshot();
        assert_eq!(snap.player_state, PlayerState::Starting);
        assert_eq!(snap.machine_state, "STARTING");
        assert!(!snap.running);
        assert_eq!(
            controller.start().await,
            Err(RunError::AlreadyRunning(PlayerState::Starting))
        );

        assert!(controller.stop().await);
        assert_eq!(starting.await.unwrap(), Err(RunError::Cancelled));

        sleep(Duration::from_secs(3)).await;
        let snap = controller.snapshot();
        assert!(!snap.running);
        assert_eq!(snap.player_state, PlayerState::Idle);
        assert!(mock.pose_calls().is_empty());
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Home)), 0);

        // The next start goes through
        mock.set_config_delay(None);
        controller.start().await.unwrap();
        assert!(controller.snapshot().running);
        assert!(controller.stop().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_move_skips_home_return() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;
        controller.start().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let outcome = controller.manual_override(Action::movement(Pose::Close)).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(controller.snapshot().player_state, PlayerState::Idle);
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Home)), 0);
        assert_eq!(controller.snapshot().machine_state, "CLOSE");

        // Nothing from the cancelled run fires afterwards
        mock.take_calls();
        sleep(Duration::from_secs(5)).await;
        assert!(mock.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_aux_stops_run_with_home_return() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;
        controller.start().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        controller
            .manual_override(Action::aux(AuxDevice::Blower, AuxCommand::Start, Some(40)))
            .await
            .unwrap();
        assert_eq!(mock.count(|c| matches!(c, ActuatorCall::Home)), 1);
        assert!(mock.aux_running(AuxDevice::Blower));
        assert!(controller.snapshot().blower_running);
    }

    #[tokio::test]
    async fn test_manual_override_when_idle_only_dispatches() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;
        controller.manual_override(Action::movement(Pose::Dip)).await.unwrap();

        let calls: Vec<ActuatorCall> = mock.calls().into_iter().map(|c| c.call).collect();
        assert_eq!(calls, vec![ActuatorCall::SetPose(Pose::Dip)]);
    }

    #[tokio::test]
    async fn test_edits_and_remote_config_follow_timeline() {
        let mock = Arc::new(MockActuator::new("pi"));
        let controller = controller(&mock).await;

        let mut profile = MotionProfile::default();
        profile.seconds_per_step = 0.004;
        controller.edit_timeline(|t| t.set_motion_profile(profile)).unwrap();

        let remote = controller.remote_config();
        assert_eq!(remote.step_delay, 0.004);
        assert_eq!(remote.dip_duration, 5.0);
        assert_eq!(controller.timeline().motion_profile().seconds_per_step, 0.004);

        let json = serde_json::to_value(controller.snapshot()).unwrap();
        assert_eq!(json["machineState"], "IDLE");
        assert_eq!(json["playerState"], "idle");
        assert!(json.get("lastError").is_none());
    }
}
