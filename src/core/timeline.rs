//! Multi-track timeline of action blocks
//!
//! A timeline is a set of typed tracks. Each block is anchored at an absolute
//! offset from loop start; list order inside a track carries no meaning. The
//! loop length is derived from the latest block end and is recomputed after
//! every mutation.
//!
//! Blocks are validated on write: a block whose kind does not match its
//! track, whose timing is invalid, or whose pose has no configured target is
//! rejected and never reaches the scheduler.

use crate::core::action::{Action, TrackKind, UnknownLabel};
use crate::core::block::{ActionBlock, BlockId};
use crate::core::motion::{AxisPositions, MotionProfile};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default track names
pub const MOTORS_TRACK: &str = "motors";
pub const BLOWER_TRACK: &str = "blower";
pub const FOGGER_TRACK: &str = "fogger";

/// Rejected timeline mutation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    #[error("{kind} block {block} does not belong on {expected} track {track:?}")]
    TrackKindMismatch {
        block: BlockId,
        track: String,
        expected: TrackKind,
        kind: TrackKind,
    },

    #[error("no track named {0:?}")]
    UnknownTrack(String),

    #[error("track {0:?} already exists")]
    DuplicateTrack(String),

    #[error("no block with id {0}")]
    UnknownBlock(BlockId),

    #[error("block {0} is already on the timeline")]
    DuplicateBlock(BlockId),

    #[error("block {block}: {reason}")]
    InvalidTiming { block: BlockId, reason: &'static str },

    #[error("block {block}: intensity {value} is outside 0-100")]
    InvalidIntensity { block: BlockId, value: u8 },

    #[error("unknown action {0:?}")]
    UnknownAction(String),
}

impl From<UnknownLabel> for TimelineError {
    fn from(err: UnknownLabel) -> Self {
        TimelineError::UnknownAction(err.0)
    }
}

/// A named lane holding blocks of a single kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    name: String,
    kind: TrackKind,
    #[serde(default)]
    blocks: Vec<ActionBlock>,
}

impl Track {
    pub fn new(name: &str, kind: TrackKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            blocks: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn blocks(&self) -> &[ActionBlock] {
        &self.blocks
    }
}

/// A block together with its absolute start offset
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBlock {
    pub block: ActionBlock,
    pub start: Duration,
}

/// Serialized form of a timeline
///
/// Only the tracks are stored; the loop length is always derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineDocument {
    pub tracks: Vec<Track>,
}

/// Ordered tracks plus the derived loop length
#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    tracks: Vec<Track>,
    motion: MotionProfile,
    /// Arm positions at loop start, used to chain travel estimates
    origin: AxisPositions,
    loop_duration: f64,
}

impl Timeline {
    /// Empty timeline without tracks
    pub fn new(motion: MotionProfile) -> Self {
        let origin = motion.targets.get(crate::core::Pose::HOME).unwrap_or_default();
        Self {
            tracks: Vec::new(),
            motion,
            origin,
            loop_duration: 0.0,
        }
    }

    /// Timeline with the standard `motors`, `blower` and `fogger` tracks
    pub fn with_default_tracks(motion: MotionProfile) -> Self {
        let mut timeline = Self::new(motion);
        timeline.tracks = vec![
            Track::new(MOTORS_TRACK, TrackKind::Movement),
            Track::new(BLOWER_TRACK, TrackKind::Blower),
            Track::new(FOGGER_TRACK, TrackKind::Fogger),
        ];
        timeline
    }

    /// Rebuild a timeline from its document, validating every block
    pub fn from_document(document: TimelineDocument, motion: MotionProfile) -> Result<Self, TimelineError> {
        let mut timeline = Self::new(motion);
        for track in document.tracks {
            timeline.add_track(&track.name, track.kind)?;
            for block in track.blocks {
                timeline.insert_block(&track.name, block)?;
            }
        }
        Ok(timeline)
    }

    pub fn to_document(&self) -> TimelineDocument {
        TimelineDocument {
            tracks: self.tracks.clone(),
        }
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, name: &str) -> Option<&Track> {
        self.tracks.iter().find(|t| t.name == name)
    }

    pub fn motion_profile(&self) -> &MotionProfile {
        &self.motion
    }

    pub fn origin(&self) -> AxisPositions {
        self.origin
    }

    /// Loop length in seconds
    pub fn loop_duration(&self) -> f64 {
        self.loop_duration
    }

    /// Loop length as a duration
    pub fn loop_length(&self) -> Duration {
        Duration::try_from_secs_f64(self.loop_duration).unwrap_or_default()
    }

    pub fn block_count(&self) -> usize {
        self.tracks.iter().map(|t| t.blocks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.block_count() == 0
    }

    /// Look up a block by id
    pub fn block(&self, id: BlockId) -> Option<&ActionBlock> {
        self.tracks
            .iter()
            .flat_map(|t| t.blocks.iter())
            .find(|b| b.id == id)
    }

    /// Name of the track holding a block
    pub fn track_of(&self, id: BlockId) -> Option<&str> {
        self.tracks
            .iter()
            .find(|t| t.blocks.iter().any(|b| b.id == id))
            .map(|t| t.name.as_str())
    }

    pub fn add_track(&mut self, name: &str, kind: TrackKind) -> Result<(), TimelineError> {
        if self.track(name).is_some() {
            return Err(TimelineError::DuplicateTrack(name.to_string()));
        }
        self.tracks.push(Track::new(name, kind));
        Ok(())
    }

    /// Add a block to a named track
    pub fn insert_block(&mut self, track: &str, block: ActionBlock) -> Result<BlockId, TimelineError> {
        if self.block(block.id).is_some() {
            return Err(TimelineError::DuplicateBlock(block.id));
        }
        let index = self.track_index(track)?;
        self.validate(&self.tracks[index], &block)?;

        let id = block.id;
        self.tracks[index].blocks.push(block);
        self.recompute();
        Ok(id)
    }

    /// Remove a block wherever it lives
    pub fn remove_block(&mut self, id: BlockId) -> Result<ActionBlock, TimelineError> {
        let (track, pos) = self.locate(id)?;
        let block = self.tracks[track].blocks.remove(pos);
        self.recompute();
        Ok(block)
    }

    /// Replace a block's contents, keeping its id and track
    pub fn update_block(&mut self, id: BlockId, mut block: ActionBlock) -> Result<(), TimelineError> {
        let (track, pos) = self.locate(id)?;
        block.id = id;
        self.validate(&self.tracks[track], &block)?;
        self.tracks[track].blocks[pos] = block;
        self.recompute();
        Ok(())
    }

    /// Change a block's start offset
    pub fn move_block(&mut self, id: BlockId, start_s: f64) -> Result<(), TimelineError> {
        let mut block = self.block(id).cloned().ok_or(TimelineError::UnknownBlock(id))?;
        block.start_s = start_s;
        self.update_block(id, block)
    }

    /// Change a block's duration
    pub fn resize_block(&mut self, id: BlockId, duration_s: f64) -> Result<(), TimelineError> {
        let mut block = self.block(id).cloned().ok_or(TimelineError::UnknownBlock(id))?;
        block.duration_s = duration_s;
        self.update_block(id, block)
    }

    /// Change the step rate or pose targets
    ///
    /// Rejected if a movement block on the timeline would lose its target.
    pub fn set_motion_profile(&mut self, motion: MotionProfile) -> Result<(), TimelineError> {
        if let Some(pose) = self
            .tracks
            .iter()
            .flat_map(|t| t.blocks.iter())
            .filter_map(|b| b.action.pose())
            .find(|pose| !motion.targets.contains(*pose))
        {
            return Err(TimelineError::UnknownAction(pose.to_string()));
        }
        self.motion = motion;
        self.recompute();
        Ok(())
    }

    /// Set the arm positions the loop starts from
    pub fn set_origin(&mut self, origin: AxisPositions) {
        if self.origin != origin {
            self.origin = origin;
            self.recompute();
        }
    }

    /// All blocks across all tracks, sorted by start offset
    ///
    /// Ties keep track order, then list order.
    pub fn flatten(&self) -> Vec<ScheduledBlock> {
        self.sorted_blocks()
            .into_iter()
            .map(|block| ScheduledBlock {
                block: block.clone(),
                start: block.start(),
            })
            .collect()
    }

    /// Effective duration of every block, in schedule order
    ///
    /// Movement blocks take their estimated travel from the previous
    /// movement's target (or the origin) plus their hold; blower and fogger
    /// blocks take their stored duration.
    pub fn effective_durations(&self) -> Vec<(BlockId, f64)> {
        let mut position = self.origin;
        self.sorted_blocks()
            .into_iter()
            .map(|block| {
                let effective = match block.action {
                    Action::Movement { .. } => {
                        let travel = self.motion.estimate(&block.action, &position);
                        if let Some(target) = self.motion.resolve(&block.action) {
                            position = target;
                        }
                        travel + block.duration_s
                    }
                    Action::Blower { .. } | Action::Fogger { .. } => block.duration_s,
                };
                (block.id, effective)
            })
            .collect()
    }

    fn sorted_blocks(&self) -> Vec<&ActionBlock> {
        let mut blocks: Vec<&ActionBlock> = self.tracks.iter().flat_map(|t| t.blocks.iter()).collect();
        blocks.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));
        blocks
    }

    fn recompute(&mut self) {
        let starts: Vec<(BlockId, f64)> = self
            .sorted_blocks()
            .into_iter()
            .map(|b| (b.id, b.start_s))
            .collect();
        self.loop_duration = starts
            .iter()
            .zip(self.effective_durations())
            .map(|((_, start), (_, effective))| start + effective)
            .fold(0.0, f64::max);
    }

    fn track_index(&self, name: &str) -> Result<usize, TimelineError> {
        self.tracks
            .iter()
            .position(|t| t.name == name)
            .ok_or_else(|| TimelineError::UnknownTrack(name.to_string()))
    }

    fn locate(&self, id: BlockId) -> Result<(usize, usize), TimelineError> {
        self.tracks
            .iter()
            .enumerate()
            .find_map(|(ti, t)| t.blocks.iter().position(|b| b.id == id).map(|bi| (ti, bi)))
            .ok_or(TimelineError::UnknownBlock(id))
    }

    fn validate(&self, track: &Track, block: &ActionBlock) -> Result<(), TimelineError> {
        if block.kind() != track.kind {
            return Err(TimelineError::TrackKindMismatch {
                block: block.id,
                track: track.name.clone(),
                expected: track.kind,
                kind: block.kind(),
            });
        }
        if !block.start_s.is_finite() || block.start_s < 0.0 {
            return Err(TimelineError::InvalidTiming {
                block: block.id,
                reason: "start offset must be a non-negative number of seconds",
            });
        }
        if !block.duration_s.is_finite() || block.duration_s < 0.0 {
            return Err(TimelineError::InvalidTiming {
                block: block.id,
                reason: "duration must be a non-negative number of seconds",
            });
        }
        if let Some(value) = block.action.intensity() {
            if value > 100 {
                return Err(TimelineError::InvalidIntensity { block: block.id, value });
            }
        }
        if let Some(pose) = block.action.pose() {
            if !self.motion.targets.contains(pose) {
                return Err(TimelineError::UnknownAction(pose.to_string()));
            }
        }
        Ok(())
    }
}
