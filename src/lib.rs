//! # Pi Mediaserver
//!
//! sACN/DMX-controlled media playback for single-board computers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            LIGHTING CONSOLE                              │
//! │                 sACN (E1.31) multicast, universe N, 20-40Hz              │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    │ UDP 5568
//!                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  SacnTransport (network::transport)      InterfaceMonitor (2s poll)      │
//! │  socket2 multicast socket, availability   rejoins multicast on change    │
//! └──────────────────────────────────┬───────────────────────────────────────┘
//!                                    │ 512-byte frames
//!                                    ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  FrameReceiver (dmx::receiver)                                           │
//! │  ┌────────────────────────────────────────────┐     ┌─────────────────┐  │
//! │  │ ChannelGroup: 13 channels @ base address   │◄────│ SignalWatchdog  │  │
//! │  │ change detection, semantic scaling         │     │ hold / blackout │  │
//! │  └─────────────────────┬──────────────────────┘     └────────┬────────┘  │
//! └────────────────────────┼─────────────────────────────────────┼───────────┘
//!                          │ relevant change                     │ lost/restored
//!                          ▼                                     ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  PlaybackOrchestrator (orchestrator)                                     │
//! │  MediaResolver: (folder, file) → file | URL (.txt) | stream (.ndi)       │
//! └──────────────┬──────────────────────────────────────────┬────────────────┘
//!                │                                          │
//!                ▼                                          ▼
//! ┌──────────────────────────────┐     ┌─────────────────────────────────────┐
//! │  Player (player::controller) │     │  StreamReconnectManager             │
//! │  clamp → cache → engine      │     │  probe, pipe frames, reconnect loop │
//! │  MpvEngine over JSON IPC     │     │  StreamManager ── NDI runtime       │
//! └──────────────────────────────┘     │  Pipeline ── frame writer → process │
//!                                      └─────────────────────────────────────┘
//! ```

pub mod config;
pub mod dmx;
pub mod error;
pub mod media;
#[cfg(any(test, feature = "test-support"))]
#[doc(hidden)]
pub mod mock;
pub mod network;
pub mod orchestrator;
pub mod player;
pub mod server;
pub mod stream;
pub mod systemd;
pub mod util;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Slots in one DMX universe
    pub const UNIVERSE_SIZE: usize = 512;

    /// Number of channels the server listens to
    pub const NUM_CHANNELS: usize = 13;

    /// sACN (ANSI E1.31) UDP port
    pub const SACN_PORT: u16 = 5568;

    /// Highest valid sACN universe
    pub const MAX_UNIVERSE: u16 = 63999;

    /// E1.31 network data loss timeout
    pub const NETWORK_DATA_LOSS_TIMEOUT: Duration = Duration::from_millis(2500);

    /// Socket read timeout of the transport receive loop
    pub const RECEIVE_POLL: Duration = Duration::from_millis(100);

    /// Window in which a value change counts as console activity
    pub const ACTIVITY_WINDOW: Duration = Duration::from_secs(5);

    /// Interface monitor poll interval
    pub const INTERFACE_POLL: Duration = Duration::from_secs(2);

    /// Signal watchdog poll interval
    pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

    /// Stream source discovery poll interval during reconnect
    pub const RECONNECT_POLL: Duration = Duration::from_secs(3);

    /// Bounded wait for the first frame of a stream
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

    /// A stream with no frames for this long is considered dead
    pub const STREAM_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

    /// Stream health check interval
    pub const STREAM_HEALTH_INTERVAL: Duration = Duration::from_millis(500);

    /// Frame-writer queue poll
    pub const FRAME_QUEUE_POLL: Duration = Duration::from_millis(100);

    /// Frames buffered between stream delivery and the consumer
    pub const FRAME_QUEUE_CAPACITY: usize = 4;

    /// Consecutive engine failures before the engine is recreated
    pub const MAX_ENGINE_ERRORS: u32 = 3;

    /// Default bounded join for background threads
    pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

    /// Duration of the "signal lost" notice
    pub const LOST_NOTICE_DURATION: Duration = Duration::from_secs(3);

    /// Duration of the "signal restored" notice
    pub const RESTORED_NOTICE_DURATION: Duration = Duration::from_secs(2);
}
