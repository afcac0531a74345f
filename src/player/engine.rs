//! Playback engine capability
//!
//! The engine is an external media player. Values arrive already in engine
//! units; clamping and DMX scaling happen in the controller.

use std::time::Duration;

use crate::error::PlayerError;

/// One engine property write
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineProperty {
    /// Percent, 0-100
    Volume(u8),
    /// -100..=0, 0 is unmodified
    Brightness(i32),
    Contrast(i32),
    Saturation(i32),
    Gamma(i32),
    /// Playback rate, 0.25-4.0
    Speed(f64),
    /// Degrees: 0, 90, 180 or 270
    Rotation(u16),
    /// Zoom factor, 1.0 is unscaled
    Zoom(f64),
    PanX(f64),
    PanY(f64),
    Paused(bool),
    Loop(bool),
}

impl EngineProperty {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Volume(_) => "volume",
            Self::Brightness(_) => "brightness",
            Self::Contrast(_) => "contrast",
            Self::Saturation(_) => "saturation",
            Self::Gamma(_) => "gamma",
            Self::Speed(_) => "speed",
            Self::Rotation(_) => "rotation",
            Self::Zoom(_) => "zoom",
            Self::PanX(_) => "pan_x",
            Self::PanY(_) => "pan_y",
            Self::Paused(_) => "paused",
            Self::Loop(_) => "loop",
        }
    }
}

/// A running media player instance
pub trait PlaybackEngine: Send {
    /// Load and start a file path or URL
    fn play(&mut self, location: &str, looping: bool) -> Result<(), PlayerError>;

    /// Unload the current media, keeping the engine idle
    fn stop(&mut self) -> Result<(), PlayerError>;

    fn set_property(&mut self, property: EngineProperty) -> Result<(), PlayerError>;

    /// On-screen message
    fn show_message(&mut self, text: &str, duration: Duration) -> Result<(), PlayerError>;

    /// False once the engine process is gone
    fn is_alive(&mut self) -> bool;

    /// Terminate the engine
    fn shutdown(&mut self) {}
}

/// Creates engine instances, initially and after a failure
pub trait EngineFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn PlaybackEngine>, PlayerError>;
}
