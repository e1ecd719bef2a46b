//! Session registry boundary.
//!
//! The lifecycle controller talks to the session registry only through the
//! [`SessionRegistry`] trait and learns about session population changes
//! from the [`RegistryEvent`] stream obtained with
//! [`SessionRegistry::subscribe`].
//!
//! [`SessionServer`] is the bundled in-process registry. It owns every
//! admitted client and speaks the lobby protocol from `dpsrv_core::message`.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  add_client   ┌─────────────────┐
//! │   MultiServer   │──────────────▶│  SessionServer  │
//! │ (lifecycle)     │               │                 │
//! └────────▲────────┘               └────────┬────────┘
//!          │ RegistryEvent                   │ spawn
//!          │ (mpsc, delivery order)          ▼
//!          │                        ┌─────────────────┐
//!          └────────────────────────│  ClientHandler  │
//!                                   │  (per client)   │
//!                                   └─────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use dpsrv_core::SessionId;

use crate::client::Client;

mod connection;
mod identity;
mod session_server;

pub use identity::{IdentityManager, IdentityResult, StaticIdentities};
pub use session_server::SessionServer;

/// Operations the lifecycle controller needs from a session registry.
pub trait SessionRegistry: Send + 'static {
    /// Takes ownership of an admitted client connection.
    fn add_client(&mut self, client: Client);

    /// Starts disconnecting every connected user.
    ///
    /// Returns immediately; each disconnection is reported later through
    /// `RegistryEvent::UserDisconnected`.
    fn stop_all(&mut self);

    /// Number of connected users, including those not in any session.
    fn total_users(&self) -> usize;

    /// Number of live sessions.
    fn session_count(&self) -> usize;

    /// Refuse logins over connections that are not encrypted.
    fn set_must_secure(&mut self, secure: bool);

    /// Delay each incoming message by a random amount up to `lag` (debugging aid).
    fn set_random_lag(&mut self, lag: Duration);

    fn set_identity_manager(&mut self, identities: Arc<dyn IdentityManager>);

    fn announcement_client(&mut self) -> &mut AnnouncementClient;

    /// Registers a new event listener.
    ///
    /// Events are delivered to every listener in the order they happened.
    fn subscribe(&mut self) -> mpsc::UnboundedReceiver<RegistryEvent>;
}

/// Session population events published by the registry.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A new session was created.
    SessionCreated(Arc<Session>),

    /// A session ended (its last user left).
    SessionEnded(SessionId),

    /// A client logged in.
    UserLoggedIn,

    /// A client disconnected.
    UserDisconnected,
}

// ============================================================================
// Session
// ============================================================================

/// A collaborative session as seen outside the registry.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    title: String,
    recording_file: Mutex<Option<PathBuf>>,
}

impl Session {
    pub fn new(id: SessionId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            recording_file: Mutex::new(None),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// Sets the file this session is recorded to.
    pub fn set_recording_file(&self, path: PathBuf) {
        *self
            .recording_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path);
    }

    pub fn recording_file(&self) -> Option<PathBuf> {
        self.recording_file
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ============================================================================
// Announcement Client
// ============================================================================

/// Client for the public session listing server.
///
/// Only the address advertised to the listing server is tracked here.
#[derive(Debug, Clone, Default)]
pub struct AnnouncementClient {
    local_address: Option<String>,
}

impl AnnouncementClient {
    /// Sets the address that listing entries point clients at.
    pub fn set_local_address(&mut self, addr: impl Into<String>) {
        self.local_address = Some(addr.into());
    }

    pub fn local_address(&self) -> Option<&str> {
        self.local_address.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_recording_file() {
        let session = Session::new(SessionId::new(3), "test");
        assert_eq!(session.recording_file(), None);

        session.set_recording_file(PathBuf::from("/rec/3.dprec"));
        assert_eq!(
            session.recording_file(),
            Some(PathBuf::from("/rec/3.dprec"))
        );
        assert_eq!(session.id(), SessionId::new(3));
        assert_eq!(session.title(), "test");
    }

    #[test]
    fn test_announcement_local_address() {
        let mut client = AnnouncementClient::default();
        assert_eq!(client.local_address(), None);

        client.set_local_address("draw.example.com");
        assert_eq!(client.local_address(), Some("draw.example.com"));
    }
}
