//! Lifecycle controller.
//!
//! `MultiServer` owns the listening socket and the server state. It:
//! - Starts the listener (bound address or adopted descriptor)
//! - Applies admission control (ban list) to every accepted connection
//! - Hands admitted clients to the session registry
//! - Assigns recording files to new sessions
//! - Stops on request, or automatically when idle, and waits for all users
//!   to disconnect before reporting the server stopped
//!
//! # Event Model
//!
//! Everything runs on one task. [`MultiServer::run`] multiplexes stop
//! requests, registry events and new connections with a biased
//! `tokio::select!`, handling each to completion before the next, so state
//! transitions never interleave.
//!
//! ```text
//!   stop token ──┐
//!                │      ┌──────────────┐  add_client  ┌─────────────────┐
//!   registry ────┼─────▶│  MultiServer │─────────────▶│ SessionRegistry │
//!   events       │      │  (one task)  │              └────────┬────────┘
//!                │      └──────┬───────┘                       │
//!   accept() ────┘             │ report()                      │ events
//!                              ▼                               │
//!                      ┌──────────────┐                        │
//!                      │StatusReporter│      ◀─────────────────┘
//!                      └──────────────┘
//! ```
//!
//! There is no timeout on the drain: while `Stopping`, a connection that
//! never goes away keeps the server from reaching `Stopped`.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop continues after a short pause

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use dpsrv_core::message::KICK_BANNED;
use dpsrv_core::{ConfigStore, ServerState, StateError, UserId};

use crate::client::Client;
use crate::listener::{Listener, ListenerError};
use crate::registry::{IdentityManager, RegistryEvent, Session, SessionRegistry};
use crate::status::StatusReporter;

/// Pause after a failed `accept()` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Errors that can occur when starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("Server cannot start: {0}")]
    State(#[from] StateError),
}

/// The lifecycle controller.
pub struct MultiServer<R: SessionRegistry> {
    /// Configuration (recording path, ban list)
    config: Arc<dyn ConfigStore>,

    /// The session registry; connections are handed over to it
    sessions: R,

    /// Events from the session registry, in delivery order
    events: mpsc::UnboundedReceiver<RegistryEvent>,

    /// Listening socket (None before start and once stopping)
    listener: Option<Listener>,

    /// TLS certificate and key, if configured
    ssl_files: Option<(PathBuf, PathBuf)>,

    state: ServerState,

    /// Stop when the last session and user are gone
    auto_stop: bool,

    status: StatusReporter,

    /// Counter for generating client ids
    connection_counter: u64,

    /// Fires once on reaching `Stopped`
    stopped_tx: Option<oneshot::Sender<()>>,
    stopped_rx: Option<oneshot::Receiver<()>>,
}

impl<R: SessionRegistry> MultiServer<R> {
    /// Creates a server around a session registry.
    ///
    /// The server subscribes to the registry's events here.
    pub fn new(config: Arc<dyn ConfigStore>, mut sessions: R, status: StatusReporter) -> Self {
        let events = sessions.subscribe();
        let (stopped_tx, stopped_rx) = oneshot::channel();

        Self {
            config,
            sessions,
            events,
            listener: None,
            ssl_files: None,
            state: ServerState::NotStarted,
            auto_stop: false,
            status,
            connection_counter: 0,
            stopped_tx: Some(stopped_tx),
            stopped_rx: Some(stopped_rx),
        }
    }

    /// Uses TLS with the given certificate chain and key (PEM files).
    pub fn set_ssl_cert_files(&mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) {
        self.ssl_files = Some((cert.into(), key.into()));
    }

    pub fn set_must_secure(&mut self, secure: bool) {
        self.sessions.set_must_secure(secure);
    }

    pub fn set_random_lag(&mut self, lag: Duration) {
        self.sessions.set_random_lag(lag);
    }

    /// Automatically stop the server when the last session is closed.
    ///
    /// Meant for socket activation mode: the process manager starts the
    /// server again when the next connection arrives.
    pub fn set_auto_stop(&mut self, auto_stop: bool) {
        self.auto_stop = auto_stop;
    }

    pub fn set_identity_manager(&mut self, identities: Arc<dyn IdentityManager>) {
        self.sessions.set_identity_manager(identities);
    }

    pub fn set_announce_local_addr(&mut self, addr: impl Into<String>) {
        self.sessions.announcement_client().set_local_address(addr);
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn sessions(&self) -> &R {
        &self.sessions
    }

    /// Address of the listening socket while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(Listener::local_addr)
    }

    /// Receiver for the "server stopped" notification.
    ///
    /// Available once; later calls return `None`.
    pub fn stopped(&mut self) -> Option<oneshot::Receiver<()>> {
        self.stopped_rx.take()
    }

    fn create_listener(&self) -> Result<Listener, ListenerError> {
        let tls = self
            .ssl_files
            .as_ref()
            .map(|(cert, key)| (cert.as_path(), key.as_path()));
        Listener::create(tls)
    }

    /// Starts listening on `address:port`.
    ///
    /// # Errors
    ///
    /// - `ServerError::State` if the server was already started
    /// - `ServerError::Listener` if the certificate is invalid or binding
    ///   fails; the server stays `NotStarted`
    pub async fn start(&mut self, port: u16, address: IpAddr) -> Result<(), ServerError> {
        let next = self.state.transition(ServerState::Running)?;

        let mut listener = self.create_listener().inspect_err(log_start_error)?;
        listener
            .start(address, port)
            .await
            .inspect_err(log_start_error)?;

        info!(port, address = %address, "Started listening");
        self.listener = Some(listener);
        self.set_state(next);
        Ok(())
    }

    /// Starts listening on a socket passed in by the process manager.
    ///
    /// # Errors
    ///
    /// Same as [`MultiServer::start`], with `ListenerError::Descriptor` in
    /// place of a bind failure.
    pub fn start_fd(&mut self, fd: RawFd) -> Result<(), ServerError> {
        let next = self.state.transition(ServerState::Running)?;

        let mut listener = self.create_listener().inspect_err(log_start_error)?;
        listener
            .start_from_descriptor(fd)
            .inspect_err(log_start_error)?;

        info!(fd, "Started listening on passed socket");
        self.listener = Some(listener);
        self.set_state(next);
        Ok(())
    }

    /// Disconnects all clients and stops listening.
    ///
    /// The server reaches `Stopped` once every user is gone; until then the
    /// drain continues as users disconnect. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.state == ServerState::Running {
            info!(
                users = self.sessions.total_users(),
                "Stopping server and kicking out users"
            );
            self.set_state(ServerState::Stopping);
            if let Some(mut listener) = self.listener.take() {
                listener.close();
            }
            self.sessions.stop_all();
        }

        if self.state == ServerState::Stopping && self.sessions.total_users() == 0 {
            self.set_state(ServerState::Stopped);
            info!("Server stopped");
            if let Some(tx) = self.stopped_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Handles one event from the session registry.
    pub fn handle_event(&mut self, event: RegistryEvent) {
        match event {
            RegistryEvent::SessionCreated(session) => self.assign_recording(&session),
            RegistryEvent::SessionEnded(id) => {
                debug!(session = %id, "Session ended");
                self.try_auto_stop();
            }
            RegistryEvent::UserLoggedIn => self.print_status_update(),
            RegistryEvent::UserDisconnected => {
                // Fully stopped only after all users have disconnected
                if self.state == ServerState::Stopping {
                    self.print_status_update();
                    self.stop();
                } else {
                    self.try_auto_stop();
                }
            }
        }
    }

    /// Accepts or rejects a new client connection.
    pub fn new_client(&mut self, stream: TcpStream, peer: SocketAddr) {
        info!(peer = %peer, "Accepted new client");

        self.connection_counter += 1;
        let tls = self.listener.as_ref().and_then(Listener::acceptor);
        let client = Client::new(UserId::new(self.connection_counter), stream, peer, tls);

        if self.config.is_address_banned(peer.ip()) {
            info!(peer = %peer, "Kicking banned client straight away");
            client.disconnect_kick(KICK_BANNED);
        } else {
            self.sessions.add_client(client);
            self.print_status_update();
        }
    }

    /// Assigns a recording file to a newly created session.
    fn assign_recording(&self, session: &Session) {
        let pattern = self.config.recording_path();
        if let Some(path) = pattern.resolve_now(session.id()) {
            info!(session = %session.id(), path = %path.display(), "Recording session");
            session.set_recording_file(path);
        }
    }

    fn print_status_update(&self) {
        self.status
            .report(self.sessions.total_users(), self.sessions.session_count());
    }

    /// Stops the server if vacant and auto-stop is enabled.
    fn try_auto_stop(&mut self) {
        self.print_status_update();

        if self.state == ServerState::Running
            && self.auto_stop
            && self.sessions.session_count() == 0
            && self.sessions.total_users() == 0
        {
            info!("Autostopping due to lack of sessions");
            self.stop();
        }
    }

    fn set_state(&mut self, to: ServerState) {
        match self.state.transition(to) {
            Ok(next) => {
                self.state = next;
                self.status.state_changed(next);
            }
            Err(e) => error!(error = %e, "Ignoring state change"),
        }
    }

    /// Runs the event loop until the server has stopped.
    ///
    /// Cancelling `stop` requests a graceful stop. Consumes the server: once
    /// stopped it cannot be started again.
    pub async fn run(mut self, stop: CancellationToken) {
        if self.state == ServerState::NotStarted {
            warn!("Server event loop started before the listener");
            return;
        }

        while !self.state.is_terminal() {
            tokio::select! {
                biased;

                _ = stop.cancelled(), if self.state == ServerState::Running => {
                    info!("Stop requested");
                    self.stop();
                }

                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        warn!("Session registry event channel closed");
                        break;
                    }
                },

                accepted = accept_next(self.listener.as_ref()), if self.listener.is_some() => {
                    match accepted {
                        Ok((stream, peer)) => self.new_client(stream, peer),
                        Err(e) => accept_failed(e).await,
                    }
                }
            }
        }
    }
}

fn log_start_error(e: &ListenerError) {
    error!(error = %e, "Failed to start server");
}

/// Logs an accept failure and pauses before accepting again.
///
/// Errors such as running out of descriptors persist until some connection
/// closes.
async fn accept_failed(e: io::Error) {
    error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}

async fn accept_next(listener: Option<&Listener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use dpsrv_core::ServerConfig;

    use crate::registry::AnnouncementClient;
    use crate::status::StatusSink;

    #[derive(Default)]
    struct Counts {
        users: usize,
        sessions: usize,
        stop_all_calls: usize,
    }

    struct FakeRegistry {
        counts: Arc<Mutex<Counts>>,
        announcement: AnnouncementClient,
        events: Option<mpsc::UnboundedSender<RegistryEvent>>,
    }

    impl SessionRegistry for FakeRegistry {
        fn add_client(&mut self, _client: Client) {
            self.counts.lock().unwrap().users += 1;
        }

        fn stop_all(&mut self) {
            self.counts.lock().unwrap().stop_all_calls += 1;
        }

        fn total_users(&self) -> usize {
            self.counts.lock().unwrap().users
        }

        fn session_count(&self) -> usize {
            self.counts.lock().unwrap().sessions
        }

        fn set_must_secure(&mut self, _secure: bool) {}

        fn set_random_lag(&mut self, _lag: Duration) {}

        fn set_identity_manager(&mut self, _identities: Arc<dyn IdentityManager>) {}

        fn announcement_client(&mut self) -> &mut AnnouncementClient {
            &mut self.announcement
        }

        fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.events = Some(tx);
            rx
        }
    }

    fn server_with(users: usize, sessions: usize) -> (MultiServer<FakeRegistry>, Arc<Mutex<Counts>>) {
        server_with_parts(ServerConfig::default(), StatusReporter::default(), users, sessions)
    }

    fn server_with_parts(
        config: ServerConfig,
        status: StatusReporter,
        users: usize,
        sessions: usize,
    ) -> (MultiServer<FakeRegistry>, Arc<Mutex<Counts>>) {
        let counts = Arc::new(Mutex::new(Counts {
            users,
            sessions,
            stop_all_calls: 0,
        }));
        let registry = FakeRegistry {
            counts: Arc::clone(&counts),
            announcement: AnnouncementClient::default(),
            events: None,
        };
        let server = MultiServer::new(Arc::new(config), registry, status);
        (server, counts)
    }

    /// Status sink that records every notification in order.
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl StatusSink for RecordingSink {
        fn notify_status(&self, text: &str) -> io::Result<()> {
            self.0.lock().unwrap().push(text.to_string());
            Ok(())
        }

        fn notify_state(&self, state: ServerState) -> io::Result<()> {
            self.0.lock().unwrap().push(format!("state: {state}"));
            Ok(())
        }
    }

    fn recording_status() -> (StatusReporter, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reporter = StatusReporter::new(Box::new(RecordingSink(Arc::clone(&log))));
        (reporter, log)
    }

    /// Connects to the server's own listener and accepts the connection.
    async fn accept_one(server: &MultiServer<FakeRegistry>) -> (TcpStream, SocketAddr, TcpStream) {
        let addr = server.local_addr().unwrap();
        let listener = server.listener.as_ref().unwrap();
        let (remote, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer) = accepted.unwrap();
        (stream, peer, remote.unwrap())
    }

    async fn started(users: usize, sessions: usize) -> (MultiServer<FakeRegistry>, Arc<Mutex<Counts>>) {
        let (mut server, counts) = server_with(users, sessions);
        server
            .start(0, "127.0.0.1".parse().unwrap())
            .await
            .unwrap();
        (server, counts)
    }

    #[tokio::test]
    async fn test_start_enters_running() {
        let (server, _) = started(0, 0).await;
        assert_eq!(server.state(), ServerState::Running);
        assert!(server.local_addr().is_some());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (mut server, _) = started(0, 0).await;

        let err = server
            .start(0, "127.0.0.1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::State(_)));
        assert!(matches!(server.start_fd(3), Err(ServerError::State(_))));
        assert_eq!(server.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn test_invalid_certificate_keeps_not_started() {
        let (mut server, _) = server_with(0, 0);
        server.set_ssl_cert_files("/nonexistent/cert.pem", "/nonexistent/key.pem");

        let err = server
            .start(0, "127.0.0.1".parse().unwrap())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ServerError::Listener(ListenerError::InvalidCertificate { .. })
        ));
        assert_eq!(server.state(), ServerState::NotStarted);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_fd_enters_running() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let fd = std::os::fd::IntoRawFd::into_raw_fd(std_listener);

        let (mut server, _) = server_with(0, 0);
        server.start_fd(fd).unwrap();

        assert_eq!(server.state(), ServerState::Running);
        assert_eq!(server.local_addr(), Some(addr));
    }

    #[test]
    fn test_bad_descriptor_keeps_not_started() {
        let (mut server, _) = server_with(0, 0);

        let err = server.start_fd(987_654).unwrap_err();

        assert!(matches!(
            err,
            ServerError::Listener(ListenerError::Descriptor { fd: 987_654, .. })
        ));
        assert_eq!(server.state(), ServerState::NotStarted);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_status_follows_lifecycle() {
        let (status, log) = recording_status();
        let (mut server, counts) = server_with_parts(ServerConfig::default(), status, 0, 0);

        server.start(0, "127.0.0.1".parse().unwrap()).await.unwrap();

        let (stream, peer, _remote) = accept_one(&server).await;
        server.new_client(stream, peer);

        server.handle_event(RegistryEvent::UserLoggedIn);

        counts.lock().unwrap().users = 0;
        server.handle_event(RegistryEvent::UserDisconnected);

        server.stop();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "state: running",
                "1 users and 0 sessions",
                "1 users and 0 sessions",
                "0 users and 0 sessions",
                "state: stopping",
                "state: stopped",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_reported_while_draining() {
        let (status, log) = recording_status();
        let (mut server, counts) = server_with_parts(ServerConfig::default(), status, 2, 1);
        server.start(0, "127.0.0.1".parse().unwrap()).await.unwrap();

        server.stop();
        counts.lock().unwrap().users = 1;
        server.handle_event(RegistryEvent::UserDisconnected);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["state: running", "state: stopping", "1 users and 1 sessions"]
        );
    }

    #[tokio::test]
    async fn test_banned_client_not_registered_or_reported() {
        let mut config = ServerConfig::default();
        config.banned.push("127.0.0.1".parse().unwrap());
        let (status, log) = recording_status();
        let (mut server, counts) = server_with_parts(config, status, 0, 0);
        server.start(0, "127.0.0.1".parse().unwrap()).await.unwrap();

        let (stream, peer, _remote) = accept_one(&server).await;
        server.new_client(stream, peer);

        assert_eq!(counts.lock().unwrap().users, 0);
        assert_eq!(*log.lock().unwrap(), vec!["state: running"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_failure_pauses() {
        let before = tokio::time::Instant::now();

        accept_failed(io::Error::from_raw_os_error(libc::EMFILE)).await;

        assert!(before.elapsed() >= ACCEPT_ERROR_BACKOFF);
    }

    #[tokio::test]
    async fn test_stop_with_no_users_stops_immediately() {
        let (mut server, counts) = started(0, 0).await;
        let mut stopped = server.stopped().unwrap();

        server.stop();

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(counts.lock().unwrap().stop_all_calls, 1);
        assert!(stopped.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stop_waits_for_users() {
        let (mut server, counts) = started(2, 1).await;
        let mut stopped = server.stopped().unwrap();

        server.stop();
        assert_eq!(server.state(), ServerState::Stopping);
        assert!(server.local_addr().is_none(), "listener closes immediately");

        counts.lock().unwrap().users = 1;
        server.handle_event(RegistryEvent::UserDisconnected);
        assert_eq!(server.state(), ServerState::Stopping);
        assert!(stopped.try_recv().is_err());

        counts.lock().unwrap().users = 0;
        server.handle_event(RegistryEvent::UserDisconnected);
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(stopped.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (mut server, counts) = started(0, 0).await;

        server.stop();
        server.stop();
        server.handle_event(RegistryEvent::UserDisconnected);

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(counts.lock().unwrap().stop_all_calls, 1);
        assert!(server.stopped_tx.is_none());
    }

    #[test]
    fn test_stop_before_start_is_noop() {
        let (mut server, counts) = server_with(0, 0);
        server.stop();
        assert_eq!(server.state(), ServerState::NotStarted);
        assert_eq!(counts.lock().unwrap().stop_all_calls, 0);
    }

    #[tokio::test]
    async fn test_auto_stop_when_idle() {
        let (mut server, counts) = started(1, 1).await;
        server.set_auto_stop(true);

        counts.lock().unwrap().sessions = 0;
        server.handle_event(RegistryEvent::SessionEnded(dpsrv_core::SessionId::new(1)));
        assert_eq!(server.state(), ServerState::Running, "a user is still connected");

        counts.lock().unwrap().users = 0;
        server.handle_event(RegistryEvent::UserDisconnected);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_auto_stop_needs_no_sessions() {
        let (mut server, counts) = started(0, 1).await;
        server.set_auto_stop(true);

        server.handle_event(RegistryEvent::UserDisconnected);
        assert_eq!(server.state(), ServerState::Running);

        counts.lock().unwrap().sessions = 0;
        server.handle_event(RegistryEvent::SessionEnded(dpsrv_core::SessionId::new(1)));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_no_auto_stop_when_disabled() {
        let (mut server, _) = started(0, 0).await;

        server.handle_event(RegistryEvent::SessionEnded(dpsrv_core::SessionId::new(1)));
        server.handle_event(RegistryEvent::UserDisconnected);

        assert_eq!(server.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn test_session_created_without_pattern_is_not_recorded() {
        let (mut server, _) = started(1, 1).await;
        let session = Arc::new(Session::new(dpsrv_core::SessionId::new(4), ""));

        server.handle_event(RegistryEvent::SessionCreated(Arc::clone(&session)));

        assert_eq!(session.recording_file(), None);
    }

    #[tokio::test]
    async fn test_session_created_gets_recording_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            recording_path: dpsrv_core::RecordingPattern::new(
                dir.path().to_string_lossy().into_owned(),
            ),
            ..ServerConfig::default()
        };
        let (registry_server, _) = server_with(1, 1);
        let mut server = MultiServer::new(
            Arc::new(config),
            registry_server.sessions,
            StatusReporter::default(),
        );
        let session = Arc::new(Session::new(dpsrv_core::SessionId::new(4), ""));

        server.handle_event(RegistryEvent::SessionCreated(Arc::clone(&session)));

        let path = session.recording_file().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(" session 4.dprec"));
    }
}
