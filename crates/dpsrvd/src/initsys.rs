//! Integration with the process manager (systemd-style).
//!
//! - Socket activation: descriptors passed through `LISTEN_PID`/`LISTEN_FDS`
//! - Status notification: datagrams to `NOTIFY_SOCKET`
//!
//! Everything here degrades to a no-op when not running under a process
//! manager.

use std::env;
use std::io;
use std::os::fd::RawFd;
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::process;

use tracing::debug;

use dpsrv_core::ServerState;

use crate::status::{LogStatusSink, StatusSink};

/// First descriptor passed by socket activation.
pub const LISTEN_FDS_START: RawFd = 3;

/// Returns the descriptors passed to this process by socket activation.
pub fn listen_fds() -> Vec<RawFd> {
    let pid = env::var("LISTEN_PID").ok();
    let fds = env::var("LISTEN_FDS").ok();
    parse_listen_fds(pid.as_deref(), fds.as_deref(), process::id())
}

/// Interprets `LISTEN_PID`/`LISTEN_FDS` for the process `our_pid`.
pub fn parse_listen_fds(listen_pid: Option<&str>, listen_fds: Option<&str>, our_pid: u32) -> Vec<RawFd> {
    let pid_matches = listen_pid
        .and_then(|p| p.trim().parse::<u32>().ok())
        .is_some_and(|p| p == our_pid);
    if !pid_matches {
        return Vec::new();
    }

    let count = listen_fds
        .and_then(|n| n.trim().parse::<RawFd>().ok())
        .unwrap_or(0)
        .max(0);
    (LISTEN_FDS_START..LISTEN_FDS_START.saturating_add(count)).collect()
}

/// Notification socket of the process manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifySocket {
    Path(PathBuf),
    /// Linux abstract socket (`@name` in the environment)
    Abstract(Vec<u8>),
}

impl NotifySocket {
    /// Reads `NOTIFY_SOCKET` from the environment.
    pub fn from_env() -> Option<Self> {
        env::var("NOTIFY_SOCKET").ok().and_then(|s| Self::parse(&s))
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.is_empty() {
            return None;
        }
        match value.strip_prefix('@') {
            Some(name) => Some(Self::Abstract(name.as_bytes().to_vec())),
            None => Some(Self::Path(PathBuf::from(value))),
        }
    }

    /// Sends one notification datagram (e.g. `READY=1`).
    pub fn send(&self, message: &str) -> io::Result<()> {
        let socket = UnixDatagram::unbound()?;
        match self {
            Self::Path(path) => socket.send_to(message.as_bytes(), path).map(|_| ()),
            Self::Abstract(name) => send_abstract(&socket, name, message),
        }
    }
}

#[cfg(target_os = "linux")]
fn send_abstract(socket: &UnixDatagram, name: &[u8], message: &str) -> io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    socket.send_to_addr(message.as_bytes(), &addr).map(|_| ())
}

#[cfg(not(target_os = "linux"))]
fn send_abstract(_socket: &UnixDatagram, _name: &[u8], _message: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets are only supported on Linux",
    ))
}

impl StatusSink for NotifySocket {
    fn notify_status(&self, text: &str) -> io::Result<()> {
        self.send(&format!("STATUS={text}"))
    }

    fn notify_state(&self, state: ServerState) -> io::Result<()> {
        match state {
            ServerState::Running => self.send("READY=1"),
            ServerState::Stopping => self.send("STOPPING=1"),
            ServerState::NotStarted | ServerState::Stopped => Ok(()),
        }
    }
}

/// Picks the status sink: the notification socket if present, else the log.
pub fn status_sink() -> Box<dyn StatusSink> {
    match NotifySocket::from_env() {
        Some(socket) => {
            debug!(socket = ?socket, "Using process manager notification socket");
            Box::new(socket)
        }
        None => Box::new(LogStatusSink),
    }
}
