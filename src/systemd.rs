//! sd_notify over the `NOTIFY_SOCKET` datagram socket
//!
//! Absent socket means we were not started by systemd; every call is then
//! a no-op.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};

const NOTIFY_SOCKET_ENV: &str = "NOTIFY_SOCKET";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Path(PathBuf),
    /// Linux abstract namespace, given with a leading `@`
    Abstract(Vec<u8>),
}

pub struct SystemdNotifier {
    socket: UnixDatagram,
    target: Target,
}

impl SystemdNotifier {
    /// Notifier for `$NOTIFY_SOCKET`, if set
    pub fn from_env() -> Option<Self> {
        let value = std::env::var_os(NOTIFY_SOCKET_ENV)?;
        let value = value.to_string_lossy();
        let target = parse_target(&value)?;
        match Self::connect(target) {
            Ok(notifier) => Some(notifier),
            Err(e) => {
                tracing::warn!("systemd notify socket unusable: {}", e);
                None
            }
        }
    }

    /// Notifier for a filesystem socket path
    pub fn with_path(path: &Path) -> io::Result<Self> {
        Self::connect(Target::Path(path.to_path_buf()))
    }

    fn connect(target: Target) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        Ok(Self { socket, target })
    }

    /// Send a raw state string such as `READY=1`
    pub fn notify(&self, state: &str) -> io::Result<()> {
        match &self.target {
            Target::Path(path) => {
                self.socket.send_to(state.as_bytes(), path)?;
            }
            Target::Abstract(name) => send_abstract(&self.socket, name, state)?,
        }
        Ok(())
    }

    pub fn ready(&self) {
        self.send_logged("READY=1");
    }

    pub fn watchdog(&self) {
        self.send_logged("WATCHDOG=1");
    }

    pub fn stopping(&self) {
        self.send_logged("STOPPING=1");
    }

    pub fn status(&self, text: &str) {
        self.send_logged(&format!("STATUS={}", text));
    }

    fn send_logged(&self, state: &str) {
        if let Err(e) = self.notify(state) {
            tracing::debug!("sd_notify '{}' failed: {}", state, e);
        }
    }
}

fn parse_target(value: &str) -> Option<Target> {
    if value.is_empty() {
        return None;
    }
    match value.strip_prefix('@') {
        Some(name) => Some(Target::Abstract(name.as_bytes().to_vec())),
        None if value.starts_with('/') => Some(Target::Path(PathBuf::from(value))),
        None => None,
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &[u8], state: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    socket.send_to_addr(state.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &[u8], _state: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets are Linux-only",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("/run/systemd/notify"),
            Some(Target::Path("/run/systemd/notify".into()))
        );
        assert_eq!(
            parse_target("@/org/freedesktop/systemd1/notify"),
            Some(Target::Abstract(b"/org/freedesktop/systemd1/notify".to_vec()))
        );
        assert_eq!(parse_target(""), None);
        assert_eq!(parse_target("relative"), None);
    }

    #[test]
    fn test_sends_datagrams() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        let notifier = SystemdNotifier::with_path(&path).unwrap();
        notifier.ready();
        notifier.watchdog();
        notifier.stopping();

        let mut buf = [0u8; 64];
        for expected in ["READY=1", "WATCHDOG=1", "STOPPING=1"] {
            let n = listener.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], expected.as_bytes());
        }
    }
}
