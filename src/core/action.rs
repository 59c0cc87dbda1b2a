use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Label that does not name any known action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unrecognized action label: {0:?}")]
pub struct UnknownLabel(pub String);

/// Kind of lane a block can live in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Arm movement (both steppers)
    Movement,
    /// Fan blowing through the bubble rings
    Blower,
    /// Smoke machine
    Fogger,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Movement => "movement",
            TrackKind::Blower => "blower",
            TrackKind::Fogger => "fogger",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named arm pose understood by the controller
///
/// Poses are absolute: each one resolves to a target step position per axis
/// through the configured [`PoseTargets`](crate::core::PoseTargets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Pose {
    /// Arms spread in front of the blower (also the home pose)
    Open,
    /// Arms folded together
    Close,
    /// Rings lowered into the soap tray
    Dip,
}

impl Pose {
    /// Pose the machine returns to when a run stops
    pub const HOME: Pose = Pose::Open;

    pub const ALL: [Pose; 3] = [Pose::Open, Pose::Close, Pose::Dip];

    /// Wire name, as sent in `set_state`
    pub fn as_str(&self) -> &'static str {
        match self {
            Pose::Open => "OPEN",
            Pose::Close => "CLOSE",
            Pose::Dip => "DIP",
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pose {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pose::ALL
            .into_iter()
            .find(|pose| pose.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// Auxiliary device on the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxDevice {
    Blower,
    Fogger,
}

impl AuxDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuxDevice::Blower => "blower",
            AuxDevice::Fogger => "fogger",
        }
    }

    /// Track kind that carries this device's blocks
    pub fn track_kind(&self) -> TrackKind {
        match self {
            AuxDevice::Blower => TrackKind::Blower,
            AuxDevice::Fogger => TrackKind::Fogger,
        }
    }
}

impl fmt::Display for AuxDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuxDevice {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blower" | "fan" => Ok(AuxDevice::Blower),
            "fogger" | "smoke" => Ok(AuxDevice::Fogger),
            _ => Err(UnknownLabel(s.to_string())),
        }
    }
}

/// Start/stop command for an auxiliary device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuxCommand {
    Start,
    Stop,
}

impl AuxCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuxCommand::Start => "start",
            AuxCommand::Stop => "stop",
        }
    }

    /// Running flag the device has after this command
    pub fn running(&self) -> bool {
        matches!(self, AuxCommand::Start)
    }
}

impl fmt::Display for AuxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuxCommand {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" | "on" => Ok(AuxCommand::Start),
            "stop" | "off" => Ok(AuxCommand::Stop),
            _ => Err(UnknownLabel(s.to_string())),
        }
    }
}

/// What a block does when it fires
///
/// Serialized with a `kind` tag so a block reads as
/// `{"kind": "movement", "pose": "DIP"}` or
/// `{"kind": "fogger", "command": "start", "intensity": 60}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Action {
    Movement {
        pose: Pose,
    },
    Blower {
        command: AuxCommand,
        /// Fan speed in percent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intensity: Option<u8>,
    },
    Fogger {
        command: AuxCommand,
        /// Smoke output in percent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intensity: Option<u8>,
    },
}

impl Action {
    pub fn movement(pose: Pose) -> Self {
        Action::Movement { pose }
    }

    pub fn aux(device: AuxDevice, command: AuxCommand, intensity: Option<u8>) -> Self {
        match device {
            AuxDevice::Blower => Action::Blower { command, intensity },
            AuxDevice::Fogger => Action::Fogger { command, intensity },
        }
    }

    /// Parse an action from its track kind and label (`DIP`, `start`, ...)
    pub fn parse(kind: TrackKind, label: &str, intensity: Option<u8>) -> Result<Self, UnknownLabel> {
        match kind {
            TrackKind::Movement => Ok(Action::Movement { pose: label.parse()? }),
            TrackKind::Blower => Ok(Action::Blower {
                command: label.parse()?,
                intensity,
            }),
            TrackKind::Fogger => Ok(Action::Fogger {
                command: label.parse()?,
                intensity,
            }),
        }
    }

    /// Track kind this action belongs on
    pub fn kind(&self) -> TrackKind {
        match self {
            Action::Movement { .. } => TrackKind::Movement,
            Action::Blower { .. } => TrackKind::Blower,
            Action::Fogger { .. } => TrackKind::Fogger,
        }
    }

    /// Label shown on the block (`OPEN`, `start`, ...)
    pub fn label(&self) -> &'static str {
        match self {
            Action::Movement { pose } => pose.as_str(),
            Action::Blower { command, .. } | Action::Fogger { command, .. } => command.as_str(),
        }
    }

    pub fn is_movement(&self) -> bool {
        matches!(self, Action::Movement { .. })
    }

    pub fn pose(&self) -> Option<Pose> {
        match self {
            Action::Movement { pose } => Some(*pose),
            _ => None,
        }
    }

    /// Device, command and intensity for blower/fogger actions
    pub fn aux_parts(&self) -> Option<(AuxDevice, AuxCommand, Option<u8>)> {
        match *self {
            Action::Movement { .. } => None,
            Action::Blower { command, intensity } => Some((AuxDevice::Blower, command, intensity)),
            Action::Fogger { command, intensity } => Some((AuxDevice::Fogger, command, intensity)),
        }
    }

    pub fn intensity(&self) -> Option<u8> {
        self.aux_parts().and_then(|(_, _, intensity)| intensity)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.aux_parts() {
            None => write!(f, "move {}", self.label()),
            Some((device, command, Some(intensity))) => write!(f, "{} {} @{}%", device, command, intensity),
            Some((device, command, None)) => write!(f, "{} {}", device, command),
        }
    }
}
