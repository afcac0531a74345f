//! Playback control

pub mod controller;
pub mod engine;
#[cfg(unix)]
pub mod mpv;

pub use controller::Player;
pub use engine::{EngineFactory, EngineProperty, PlaybackEngine};
#[cfg(unix)]
pub use mpv::{MpvEngine, MpvFactory};
