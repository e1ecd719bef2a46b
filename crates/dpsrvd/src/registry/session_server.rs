//! In-process session registry.
//!
//! `SessionServer` owns all admitted clients and sessions. State lives in a
//! single mutex shared with the per-client handler tasks; every event is
//! published while that mutex is held, so listeners observe events in the
//! same order the state changed.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Mutex poisoning is recovered with `PoisonError::into_inner`
//! - Listeners whose receiver was dropped are pruned silently

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use dpsrv_core::message::{ERROR_BAD_MESSAGE, ERROR_NOT_FOUND, ERROR_NOT_LOGGED_IN, KICK_SHUTDOWN};
use dpsrv_core::{SessionId, UserId};

use super::connection::serve_client;
use super::{AnnouncementClient, IdentityManager, RegistryEvent, Session, SessionRegistry};
use crate::client::Client;

// ============================================================================
// Session Server
// ============================================================================

/// The bundled session registry.
pub struct SessionServer {
    shared: Arc<Shared>,
    announcement: AnnouncementClient,
}

impl Default for SessionServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionServer {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
            announcement: AnnouncementClient::default(),
        }
    }

    /// Returns all live sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        let state = self.shared.lock();
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .map(|entry| Arc::clone(&entry.session))
            .collect();
        sessions.sort_by_key(|s| s.id());
        sessions
    }
}

impl SessionRegistry for SessionServer {
    fn add_client(&mut self, client: Client) {
        let (kick_tx, kick_rx) = oneshot::channel();
        let user_id = client.id();

        self.shared.lock().clients.insert(
            user_id,
            ClientEntry {
                username: None,
                session: None,
                kick: Some(kick_tx),
            },
        );
        debug!(user = %user_id, peer = %client.peer_addr(), "Client added to registry");

        tokio::spawn(serve_client(Arc::clone(&self.shared), client, kick_rx));
    }

    fn stop_all(&mut self) {
        let mut state = self.shared.lock();
        info!(users = state.clients.len(), "Disconnecting all users");

        for entry in state.clients.values_mut() {
            if let Some(kick) = entry.kick.take() {
                // Receiver is gone only if the handler already finished
                let _ = kick.send(KICK_SHUTDOWN.to_string());
            }
        }
    }

    fn total_users(&self) -> usize {
        self.shared.lock().clients.len()
    }

    fn session_count(&self) -> usize {
        self.shared.lock().sessions.len()
    }

    fn set_must_secure(&mut self, secure: bool) {
        self.shared.lock().settings.must_secure = secure;
    }

    fn set_random_lag(&mut self, lag: Duration) {
        self.shared.lock().settings.random_lag = lag;
    }

    fn set_identity_manager(&mut self, identities: Arc<dyn IdentityManager>) {
        self.shared.lock().settings.identities = Some(identities);
    }

    fn announcement_client(&mut self) -> &mut AnnouncementClient {
        &mut self.announcement
    }

    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().listeners.push(tx);
        rx
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Registry settings read by client handlers.
#[derive(Clone, Default)]
pub(super) struct Settings {
    pub must_secure: bool,
    pub random_lag: Duration,
    pub identities: Option<Arc<dyn IdentityManager>>,
}

struct ClientEntry {
    username: Option<String>,
    session: Option<SessionId>,
    kick: Option<oneshot::Sender<String>>,
}

struct SessionEntry {
    session: Arc<Session>,
    members: HashSet<UserId>,
}

struct RegistryState {
    clients: HashMap<UserId, ClientEntry>,
    sessions: HashMap<SessionId, SessionEntry>,
    last_session_id: SessionId,
    settings: Settings,
    listeners: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl RegistryState {
    fn emit(&mut self, event: RegistryEvent) {
        self.listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn allocate_session_id(&mut self) -> SessionId {
        let mut id = self.last_session_id.next();
        while self.sessions.contains_key(&id) {
            id = id.next();
        }
        self.last_session_id = id;
        id
    }

    fn logged_in_entry(&mut self, user: UserId) -> Result<&mut ClientEntry, LobbyError> {
        match self.clients.get_mut(&user) {
            Some(entry) if entry.username.is_some() => Ok(entry),
            Some(_) => Err(LobbyError::NotLoggedIn),
            None => Err(LobbyError::UnknownClient(user)),
        }
    }
}

/// State shared between the registry and its client handlers.
pub(super) struct Shared {
    state: Mutex<RegistryState>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState {
                clients: HashMap::new(),
                sessions: HashMap::new(),
                last_session_id: SessionId::new(0),
                settings: Settings::default(),
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn settings(&self) -> Settings {
        self.lock().settings.clone()
    }

    /// Marks a client as logged in.
    pub(super) fn login(&self, user: UserId, username: String) -> Result<(), LobbyError> {
        let mut state = self.lock();
        let entry = state
            .clients
            .get_mut(&user)
            .ok_or(LobbyError::UnknownClient(user))?;
        if entry.username.is_some() {
            return Err(LobbyError::AlreadyLoggedIn);
        }

        info!(user = %user, username = %username, "User logged in");
        entry.username = Some(username);
        state.emit(RegistryEvent::UserLoggedIn);
        Ok(())
    }

    /// Creates a new session and puts the user in it.
    pub(super) fn host(&self, user: UserId, title: Option<String>) -> Result<SessionId, LobbyError> {
        let mut state = self.lock();
        if state.logged_in_entry(user)?.session.is_some() {
            return Err(LobbyError::AlreadyInSession);
        }

        let id = state.allocate_session_id();
        let session = Arc::new(Session::new(id, title.unwrap_or_default()));
        state.sessions.insert(
            id,
            SessionEntry {
                session: Arc::clone(&session),
                members: HashSet::from([user]),
            },
        );
        state.logged_in_entry(user)?.session = Some(id);

        info!(session = %id, user = %user, "Session created");
        state.emit(RegistryEvent::SessionCreated(session));
        Ok(id)
    }

    /// Puts the user in an existing session.
    pub(super) fn join(&self, user: UserId, session: SessionId) -> Result<(), LobbyError> {
        let mut state = self.lock();
        if state.logged_in_entry(user)?.session.is_some() {
            return Err(LobbyError::AlreadyInSession);
        }

        let entry = state
            .sessions
            .get_mut(&session)
            .ok_or(LobbyError::SessionNotFound(session))?;
        entry.members.insert(user);
        state.logged_in_entry(user)?.session = Some(session);

        info!(session = %session, user = %user, "User joined session");
        Ok(())
    }

    /// Forgets a disconnected client, ending its session if it was the last member.
    pub(super) fn remove_client(&self, user: UserId) {
        let mut state = self.lock();
        let Some(entry) = state.clients.remove(&user) else {
            return;
        };

        if let Some(session_id) = entry.session {
            let now_empty = state
                .sessions
                .get_mut(&session_id)
                .map(|s| {
                    s.members.remove(&user);
                    s.members.is_empty()
                })
                .unwrap_or(false);

            if now_empty {
                state.sessions.remove(&session_id);
                info!(session = %session_id, "Session ended");
                state.emit(RegistryEvent::SessionEnded(session_id));
            }
        }

        state.emit(RegistryEvent::UserDisconnected);
    }
}

/// Lobby request failures, reported to the client as error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(super) enum LobbyError {
    #[error("login required")]
    NotLoggedIn,

    #[error("already logged in")]
    AlreadyLoggedIn,

    #[error("already in a session")]
    AlreadyInSession,

    #[error("no such session: {0}")]
    SessionNotFound(SessionId),

    #[error("unknown client {0}")]
    UnknownClient(UserId),
}

impl LobbyError {
    /// Wire error code for this failure.
    pub(super) fn code(&self) -> &'static str {
        match self {
            Self::NotLoggedIn => ERROR_NOT_LOGGED_IN,
            Self::SessionNotFound(_) => ERROR_NOT_FOUND,
            Self::AlreadyLoggedIn | Self::AlreadyInSession | Self::UnknownClient(_) => {
                ERROR_BAD_MESSAGE
            }
        }
    }
}
