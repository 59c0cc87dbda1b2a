use async_trait::async_trait;
use crate::core::{AuxCommand, AuxDevice, AxisPositions, Pose, PoseTargets};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for actuator operations
pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Failure talking to the remote controller
#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller answered {code}: {body}")]
    Status { code: u16, body: String },

    #[error("controller rejected the command: {0}")]
    Rejected(String),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("actuator unavailable: {0}")]
    Unavailable(String),
}

/// Liveness probe answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub status: String,

    /// Axis positions, if the controller tracks them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<AxisPositions>,

    #[serde(rename = "fan_running", default, skip_serializing_if = "Option::is_none")]
    pub blower_running: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fogger_running: Option<bool>,
}

impl Health {
    pub fn is_ok(&self) -> bool {
        self.status.eq_ignore_ascii_case("ok")
    }
}

/// Answer to a movement or home command, sent once the move finished
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoseReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,

    /// Axis positions after the move
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub positions: Option<AxisPositions>,

    /// How long the physical move took, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
}

/// Answer to a blower/fogger command
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuxReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub running: Option<bool>,
}

/// Timing and position configuration pushed to the controller before a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    /// Seconds the rings stay in the soap
    pub dip_duration: f64,
    /// Seconds to lift out of the tray
    pub lift_duration: f64,
    /// Seconds of blowing per cycle
    pub blow_duration: f64,
    /// Seconds to fold the arms
    pub close_duration: f64,
    /// Fan duty cycle in percent
    pub fan_speed: u8,
    pub fan_enabled: bool,
    /// Seconds per motor step
    pub step_delay: f64,
    pub positions: PoseTargets,
}

/// Trait for the remote machine controller
///
/// Implementations:
/// - [`HttpActuator`](crate::hardware::HttpActuator) for the Pi on the network
/// - [`MockActuator`](crate::hardware::MockActuator) for tests and dry runs
///
/// Movement calls resolve only once the physical move is complete.
/// Calls take `&self` so a fogger command can go out while a move is
/// still in flight.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Name/identifier of this actuator
    fn name(&self) -> &str;

    /// Liveness probe
    async fn probe(&self) -> ActuatorResult<Health>;

    /// Move the arms to a named pose
    async fn set_pose(&self, pose: Pose) -> ActuatorResult<PoseReport>;

    /// Start or stop the blower or fogger
    async fn set_aux(
        &self,
        device: AuxDevice,
        command: AuxCommand,
        intensity: Option<u8>,
    ) -> ActuatorResult<AuxReport>;

    /// Replace the controller's timing and position configuration
    async fn push_config(&self, config: &RemoteConfig) -> ActuatorResult<()>;

    /// Return the arms to the home pose
    async fn home(&self) -> ActuatorResult<PoseReport>;
}
