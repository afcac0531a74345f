//! mpv adapter over its JSON IPC socket
//!
//! mpv runs in idle mode with a forced black window, so media swaps reuse
//! one process. Commands are newline-delimited JSON with a `request_id`;
//! unsolicited events on the same socket are skipped.

use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::PlayerConfig;
use crate::error::PlayerError;
use crate::player::engine::{EngineFactory, EngineProperty, PlaybackEngine};

/// How long to wait for mpv to create its IPC socket
const SOCKET_WAIT: Duration = Duration::from_secs(5);
/// Per-command reply timeout
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

/// mpv property name and value for an engine property
pub fn mpv_property(property: EngineProperty) -> (&'static str, Value) {
    match property {
        EngineProperty::Volume(v) => ("volume", json!(v)),
        EngineProperty::Brightness(v) => ("brightness", json!(v)),
        EngineProperty::Contrast(v) => ("contrast", json!(v)),
        EngineProperty::Saturation(v) => ("saturation", json!(v)),
        EngineProperty::Gamma(v) => ("gamma", json!(v)),
        EngineProperty::Speed(v) => ("speed", json!(v)),
        EngineProperty::Rotation(deg) => ("video-rotate", json!(deg)),
        // mpv zoom is log2: 0 = 1x, 1 = 2x, -1 = 0.5x
        EngineProperty::Zoom(factor) => ("video-zoom", json!(factor.max(0.01).log2())),
        EngineProperty::PanX(v) => ("video-pan-x", json!(v)),
        EngineProperty::PanY(v) => ("video-pan-y", json!(v)),
        EngineProperty::Paused(p) => ("pause", json!(p)),
        EngineProperty::Loop(l) => ("loop-file", json!(if l { "inf" } else { "no" })),
    }
}

pub struct MpvEngine {
    child: Child,
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_request: u64,
}

impl MpvEngine {
    pub fn spawn(config: &PlayerConfig) -> Result<Self, PlayerError> {
        let socket = &config.ipc_socket;
        // A stale socket from a previous run would satisfy the wait below
        let _ = std::fs::remove_file(socket);

        let mut child = Command::new(&config.binary)
            .arg("--idle=yes")
            .arg("--force-window=immediate")
            .arg("--no-terminal")
            .arg("--no-config")
            .arg("--input-default-bindings=no")
            .arg("--input-vo-keyboard=no")
            .arg(format!("--input-ipc-server={}", socket.display()))
            .args(&config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PlayerError::SpawnFailed(format!("{}: {}", config.binary, e)))?;

        let stream = match connect(socket, SOCKET_WAIT) {
            Ok(stream) => stream,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        };
        stream.set_read_timeout(Some(REPLY_TIMEOUT))?;
        let reader = BufReader::new(stream.try_clone()?);

        tracing::info!("mpv started (pid {})", child.id());
        Ok(Self {
            child,
            writer: stream,
            reader,
            next_request: 1,
        })
    }

    /// Send a command and wait for its reply
    fn command(&mut self, args: Value) -> Result<Value, PlayerError> {
        let request_id = self.next_request;
        self.next_request += 1;

        let mut line = serde_json::to_vec(&json!({ "command": args, "request_id": request_id }))?;
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .map_err(|e| PlayerError::Ipc(e.to_string()))?;

        let deadline = Instant::now() + REPLY_TIMEOUT;
        let mut buf = String::new();
        while Instant::now() < deadline {
            buf.clear();
            let n = self
                .reader
                .read_line(&mut buf)
                .map_err(|e| PlayerError::Ipc(e.to_string()))?;
            if n == 0 {
                return Err(PlayerError::NotRunning);
            }
            let reply: Value = match serde_json::from_str(&buf) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if reply.get("request_id").and_then(Value::as_u64) != Some(request_id) {
                continue;
            }
            return match reply.get("error").and_then(Value::as_str) {
                Some("success") => Ok(reply.get("data").cloned().unwrap_or(Value::Null)),
                Some(reason) => Err(PlayerError::CommandRejected {
                    command: args.to_string(),
                    reason: reason.to_string(),
                }),
                None => Err(PlayerError::Ipc("reply without status".into())),
            };
        }
        Err(PlayerError::Ipc(format!("no reply to {}", args)))
    }
}

fn connect(socket: &Path, timeout: Duration) -> Result<UnixStream, PlayerError> {
    let deadline = Instant::now() + timeout;
    loop {
        match UnixStream::connect(socket) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(PlayerError::Ipc(format!(
                    "cannot connect to '{}': {}",
                    socket.display(),
                    e
                )))
            }
            Err(_) => thread::sleep(Duration::from_millis(50)),
        }
    }
}

impl PlaybackEngine for MpvEngine {
    fn play(&mut self, location: &str, looping: bool) -> Result<(), PlayerError> {
        self.set_property(EngineProperty::Loop(looping))?;
        self.command(json!(["loadfile", location, "replace"]))?;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PlayerError> {
        self.command(json!(["stop"]))?;
        Ok(())
    }

    fn set_property(&mut self, property: EngineProperty) -> Result<(), PlayerError> {
        let (name, value) = mpv_property(property);
        self.command(json!(["set_property", name, value]))?;
        Ok(())
    }

    fn show_message(&mut self, text: &str, duration: Duration) -> Result<(), PlayerError> {
        self.command(json!(["show-text", text, duration.as_millis() as u64]))?;
        Ok(())
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn shutdown(&mut self) {
        let _ = self.command(json!(["quit"]));
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if !self.is_alive() {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for MpvEngine {
    fn drop(&mut self) {
        if self.is_alive() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawns a fresh mpv for each engine request
#[derive(Debug, Clone)]
pub struct MpvFactory {
    config: PlayerConfig,
}

impl MpvFactory {
    pub fn new(config: PlayerConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for MpvFactory {
    fn create(&self) -> Result<Box<dyn PlaybackEngine>, PlayerError> {
        Ok(Box::new(MpvEngine::spawn(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_names() {
        assert_eq!(mpv_property(EngineProperty::Rotation(90)), ("video-rotate", json!(90)));
        assert_eq!(mpv_property(EngineProperty::PanY(-0.5)), ("video-pan-y", json!(-0.5)));
        assert_eq!(mpv_property(EngineProperty::Loop(true)), ("loop-file", json!("inf")));
        assert_eq!(mpv_property(EngineProperty::Loop(false)), ("loop-file", json!("no")));
        assert_eq!(mpv_property(EngineProperty::Paused(true)), ("pause", json!(true)));
    }

    #[test]
    fn test_zoom_is_log2() {
        let (name, value) = mpv_property(EngineProperty::Zoom(2.0));
        assert_eq!(name, "video-zoom");
        assert!((value.as_f64().unwrap() - 1.0).abs() < 1e-9);
        let (_, value) = mpv_property(EngineProperty::Zoom(1.0));
        assert_eq!(value.as_f64().unwrap(), 0.0);
        let (_, value) = mpv_property(EngineProperty::Zoom(0.5));
        assert!((value.as_f64().unwrap() + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let config = PlayerConfig {
            binary: "/nonexistent/mpv-binary".into(),
            ipc_socket: std::env::temp_dir().join("pi-mediaserver-test.sock"),
            extra_args: Vec::new(),
        };
        assert!(matches!(
            MpvFactory::new(config).create(),
            Err(PlayerError::SpawnFailed(_))
        ));
    }
}
