//! DMX decoding, reception and signal supervision

pub mod channel;
pub mod receiver;
pub mod watchdog;

pub use channel::{offsets, ChannelGroup, DmxFrame, PlayMode, PlayerState, Rotation};
pub use receiver::{FrameReceiver, UpdateCallback};
pub use watchdog::{FailsafeActions, SignalSource, SignalWatchdog, Transition};
