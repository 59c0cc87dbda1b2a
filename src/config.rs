//! Persistent engine settings
//!
//! Stored as camelCase JSON under the user's config directory
//! (`~/.config/bubblebot/settings.json` on Linux). A missing file means
//! defaults; every field is optional in the file.

use crate::core::{MotionProfile, Timeline, TimelineDocument};
use crate::hardware::RemoteConfig;
use crate::playback::PlaybackConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Where the remote controller lives and how often it is probed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActuatorSettings {
    pub base_url: String,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
}

impl Default for ActuatorSettings {
    fn default() -> Self {
        Self {
            base_url: "http://bubblebot.local:5000".to_string(),
            probe_interval_ms: 2000,
            probe_timeout_ms: 1500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerSettings {
    pub tick_ms: u64,
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self { tick_ms: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BlowerSettings {
    /// Run the blower for the whole duration of a run
    pub enabled: bool,
    /// Fan speed in percent
    pub speed: u8,
}

impl Default for BlowerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            speed: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FoggerSettings {
    /// Smoke output in percent
    pub intensity: u8,
}

impl Default for FoggerSettings {
    fn default() -> Self {
        Self { intensity: 100 }
    }
}

/// Wait times the controller uses for its own dip cycle, in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteTimings {
    pub dip_duration: f64,
    pub lift_duration: f64,
    pub blow_duration: f64,
    pub close_duration: f64,
}

impl Default for RemoteTimings {
    fn default() -> Self {
        Self {
            dip_duration: 5.0,
            lift_duration: 4.0,
            blow_duration: 3.0,
            close_duration: 1.5,
        }
    }
}

/// All engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub actuator: ActuatorSettings,
    pub player: PlayerSettings,
    pub motion: MotionProfile,
    pub blower: BlowerSettings,
    pub fogger: FoggerSettings,
    pub remote: RemoteTimings,
}

impl Settings {
    /// Default settings location
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("bubblebot").join("settings.json"))
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let settings = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Save to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path().context("No config directory on this platform")?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.actuator.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.actuator.probe_timeout_ms)
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            tick: Duration::from_millis(self.player.tick_ms.max(1)),
            blower_enabled: self.blower.enabled,
            blower_speed: self.blower.speed.min(100),
        }
    }

    /// Configuration object pushed to the controller before a run
    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            dip_duration: self.remote.dip_duration,
            lift_duration: self.remote.lift_duration,
            blow_duration: self.remote.blow_duration,
            close_duration: self.remote.close_duration,
            fan_speed: self.blower.speed.min(100),
            fan_enabled: self.blower.enabled,
            step_delay: self.motion.seconds_per_step,
            positions: self.motion.targets.clone(),
        }
    }
}

/// Load a timeline document, validating every block against `motion`
pub fn load_timeline(path: &Path, motion: MotionProfile) -> Result<Timeline> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read timeline from {}", path.display()))?;
    let document: TimelineDocument = serde_json::from_str(&contents)
        .with_context(|| format!("Invalid timeline JSON in {}", path.display()))?;
    let timeline = Timeline::from_document(document, motion)
        .with_context(|| format!("Invalid timeline in {}", path.display()))?;
    info!(
        "Loaded {} blocks from {} (loop {:.2}s)",
        timeline.block_count(),
        path.display(),
        timeline.loop_duration()
    );
    Ok(timeline)
}

pub fn save_timeline(path: &Path, timeline: &Timeline) -> Result<()> {
    let json = serde_json::to_string_pretty(&timeline.to_document())?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
