//! BubbleBot timeline engine
//!
//! Plays a looping multi-track timeline of arm movements, blower and fogger
//! commands against the bubble machine's network controller, with manual
//! overrides and a connectivity monitor keeping the cached machine state
//! honest.
//!
//! - [`core`]: action vocabulary, blocks, timeline model and travel estimates
//! - [`hardware`]: the controller interface, its HTTP and mock implementations
//! - [`playback`]: dispatcher, looping player and the run controller
//! - [`config`]: persistent settings

pub mod config;
pub mod core;
pub mod hardware;
pub mod playback;
