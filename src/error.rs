//! Error types for the media server

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Player error: {0}")]
    Player(#[from] PlayerError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control-frame transport errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Multicast join failed for universe {universe}: {reason}")]
    JoinFailed { universe: u16, reason: String },

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Invalid packet: {0}")]
    InvalidPacket(&'static str),

    #[error("Unsupported vector 0x{0:08x}")]
    UnsupportedVector(u32),

    #[error("Transport not started")]
    NotStarted,
}

/// Playback engine errors
#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("Failed to spawn engine: {0}")]
    SpawnFailed(String),

    #[error("Engine IPC failed: {0}")]
    Ipc(String),

    #[error("Engine rejected command '{command}': {reason}")]
    CommandRejected { command: String, reason: String },

    #[error("Engine is not running")]
    NotRunning,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network video stream errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Stream runtime not available")]
    Unavailable,

    #[error("Failed to load stream runtime: {0}")]
    LibraryLoad(String),

    #[error("Stream runtime initialization failed")]
    InitFailed,

    #[error("Failed to create receiver for '{0}'")]
    ReceiverCreate(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Consumer failed: {0}")]
    Consumer(String),

    #[error("Invalid source name: {0}")]
    InvalidSource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
