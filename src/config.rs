//! Configuration loading
//!
//! Every field has a default, so a partial file only overrides what it
//! names. A missing or unparsable file falls back to defaults.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::{MAX_UNIVERSE, UNIVERSE_SIZE};
use crate::error::ConfigError;
use crate::stream::Bandwidth;

/// System-wide fallback location
pub const SYSTEM_CONFIG_PATH: &str = "/etc/pi-mediaserver/config.toml";

/// Policy applied when the DMX link is lost
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FailMode {
    /// Keep the last state
    #[default]
    Hold,
    /// Stop playback
    Blackout,
}

impl From<String> for FailMode {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "blackout" => Self::Blackout,
            "hold" => Self::Hold,
            other => {
                tracing::warn!("Unknown fail mode '{}', using 'hold'", other);
                Self::Hold
            }
        }
    }
}

impl From<FailMode> for String {
    fn from(mode: FailMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hold => write!(f, "hold"),
            Self::Blackout => write!(f, "blackout"),
        }
    }
}

fn clamped_address<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
    let raw = i64::deserialize(d)?;
    Ok(raw.clamp(1, UNIVERSE_SIZE as i64) as u16)
}

fn clamped_universe<'de, D: Deserializer<'de>>(d: D) -> Result<u16, D::Error> {
    let raw = i64::deserialize(d)?;
    Ok(raw.clamp(1, i64::from(MAX_UNIVERSE)) as u16)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmxConfig {
    /// First DMX channel (1-512)
    #[serde(deserialize_with = "clamped_address")]
    pub address: u16,
    /// sACN universe (1-63999)
    #[serde(deserialize_with = "clamped_universe")]
    pub universe: u16,
    pub media_path: PathBuf,
    pub fail_mode: FailMode,
    /// Show on-screen notices on signal loss and recovery
    pub fail_osd: bool,
}

impl Default for DmxConfig {
    fn default() -> Self {
        Self {
            address: 1,
            universe: 1,
            media_path: PathBuf::from("/home/pi/media/"),
            fail_mode: FailMode::Hold,
            fail_osd: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub bandwidth: Bandwidth,
    /// Explicit path to the NDI runtime library
    pub library_path: Option<PathBuf>,
    /// Command receiving raw BGRA frames on stdin. `{width}` and `{height}`
    /// are substituted per connection.
    pub consumer: Vec<String>,
    /// Show "reconnecting" notices
    pub notify: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bandwidth: Bandwidth::Lowest,
            library_path: None,
            consumer: [
                "mpv",
                "--really-quiet",
                "--fullscreen",
                "--no-cache",
                "--untimed",
                "--demuxer=rawvideo",
                "--demuxer-rawvideo-w={width}",
                "--demuxer-rawvideo-h={height}",
                "--demuxer-rawvideo-mp-format=bgra",
                "--demuxer-rawvideo-fps=30",
                "-",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            notify: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub binary: String,
    pub ipc_socket: PathBuf,
    pub extra_args: Vec<String>,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            binary: "mpv".to_string(),
            ipc_socket: PathBuf::from("/tmp/pi-mediaserver-mpv.sock"),
            extra_args: [
                "--fullscreen",
                "--hwdec=auto",
                "--osc=no",
                "--background-color=#000000",
                "--cache=auto",
                "--framedrop=vo",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dmx: DmxConfig,
    pub stream: StreamConfig,
    pub player: PlayerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read and parse a config file
    pub fn try_load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `path` or the default location, falling back to defaults
    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
            let config = Self::default();
            tracing::info!("No config file found, using defaults ({})", config.dmx_label());
            return config;
        };

        if !path.is_file() {
            let config = Self::default();
            tracing::info!(
                "Config file '{}' not found, using defaults ({})",
                path.display(),
                config.dmx_label()
            );
            return config;
        }

        match Self::try_load(&path) {
            Ok(config) => {
                tracing::info!(
                    "Loaded config from '{}': address {}",
                    path.display(),
                    config.dmx_label()
                );
                config
            }
            Err(e) => {
                let config = Self::default();
                tracing::error!("Error reading config: {}", e);
                tracing::info!("Using defaults ({})", config.dmx_label());
                config
            }
        }
    }

    /// Human-readable DMX patch, e.g. "1.1"
    pub fn dmx_label(&self) -> String {
        format!("{}.{}", self.dmx.universe, self.dmx.address)
    }
}

/// First existing file of the per-user and system config locations
pub fn default_config_path() -> Option<PathBuf> {
    let user = directories::ProjectDirs::from("", "", "pi-mediaserver")
        .map(|dirs| dirs.config_dir().join("config.toml"));
    user.into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG_PATH)))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.dmx.address, 1);
        assert_eq!(config.dmx.universe, 1);
        assert_eq!(config.dmx.fail_mode, FailMode::Hold);
        assert!(config.dmx.fail_osd);
        assert_eq!(config.stream.bandwidth, Bandwidth::Lowest);
        assert_eq!(config.dmx_label(), "1.1");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [dmx]
            address = 20
            fail_mode = "blackout"
            "#,
        )
        .unwrap();
        assert_eq!(config.dmx.address, 20);
        assert_eq!(config.dmx.universe, 1);
        assert_eq!(config.dmx.fail_mode, FailMode::Blackout);
        assert_eq!(config.player.binary, "mpv");
    }

    #[test]
    fn test_values_are_clamped() {
        let config = AppConfig::from_toml_str(
            r#"
            [dmx]
            address = 9000
            universe = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.dmx.address, 512);
        assert_eq!(config.dmx.universe, 1);

        let config = AppConfig::from_toml_str("[dmx]\nuniverse = 70000\naddress = -3").unwrap();
        assert_eq!(config.dmx.universe, 63999);
        assert_eq!(config.dmx.address, 1);
    }

    #[test]
    fn test_unknown_enums_fall_back() {
        let config = AppConfig::from_toml_str(
            r#"
            [dmx]
            fail_mode = "explode"
            [stream]
            bandwidth = "ludicrous"
            "#,
        )
        .unwrap();
        assert_eq!(config.dmx.fail_mode, FailMode::Hold);
        assert_eq!(config.stream.bandwidth, Bandwidth::Lowest);
    }

    #[test]
    fn test_load_falls_back_on_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "this is [not toml").unwrap();
        let config = AppConfig::load(Some(file.path()));
        assert_eq!(config.dmx.address, 1);
        assert!(AppConfig::try_load(file.path()).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dmx]\naddress = 7\nuniverse = 3\nmedia_path = \"/srv/media\"").unwrap();
        let config = AppConfig::load(Some(file.path()));
        assert_eq!(config.dmx_label(), "3.7");
        assert_eq!(config.dmx.media_path, PathBuf::from("/srv/media"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load(Some(Path::new("/nonexistent/pi-mediaserver.toml")));
        assert_eq!(config.dmx_label(), "1.1");
    }
}
