pub mod action;
pub mod block;
pub mod motion;
pub mod timeline;

pub use action::{Action, AuxCommand, AuxDevice, Pose, TrackKind, UnknownLabel};
pub use block::{ActionBlock, BlockId};
pub use motion::{estimate_movement_duration, AxisPositions, MotionProfile, PoseTargets, DEFAULT_SECONDS_PER_STEP};
pub use timeline::{
    ScheduledBlock, Timeline, TimelineDocument, TimelineError, Track, BLOWER_TRACK, FOGGER_TRACK, MOTORS_TRACK,
};
