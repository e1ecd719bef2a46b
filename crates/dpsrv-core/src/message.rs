//! Lobby wire messages.
//!
//! Messages are exchanged as newline-delimited JSON objects tagged by a
//! `type` field. Only the lobby part of the conversation (login, hosting
//! and joining sessions, kicks) is covered here.

use serde::{Deserialize, Serialize};

use crate::session::{SessionId, UserId};

/// Kick reason sent to clients whose address is banned.
pub const KICK_BANNED: &str = "BANNED";

/// Kick reason sent to every client when the server shuts down.
pub const KICK_SHUTDOWN: &str = "SHUTDOWN";

/// Error code for a plaintext login on a server that requires TLS.
pub const ERROR_MUST_SECURE: &str = "MUST_SECURE";

/// Error code for a registered username with the wrong password.
pub const ERROR_BAD_PASSWORD: &str = "BAD_PASSWORD";

/// Error code for an unknown session.
pub const ERROR_NOT_FOUND: &str = "NOT_FOUND";

/// Error code for a session command sent before logging in.
pub const ERROR_NOT_LOGGED_IN: &str = "NOT_LOGGED_IN";

/// Error code for a line that is not a valid client message.
pub const ERROR_BAD_MESSAGE: &str = "BAD_MESSAGE";

/// Messages sent from clients to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in with a username (and password for registered users)
    Login {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Create a new session and join it
    Host {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },

    /// Join an existing session
    Join { session: SessionId },
}

impl ClientMessage {
    /// Creates a login message.
    pub fn login(username: impl Into<String>, password: Option<String>) -> Self {
        Self::Login {
            username: username.into(),
            password,
        }
    }

    /// Creates a host message.
    pub fn host(title: Option<String>) -> Self {
        Self::Host { title }
    }

    /// Creates a join message.
    pub fn join(session: SessionId) -> Self {
        Self::Join { session }
    }
}

/// Messages sent from the server to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Login accepted
    LoggedIn { user_id: UserId },

    /// Joined (or created) a session
    Joined { session: SessionId },

    /// Request refused; the connection stays open unless stated otherwise
    Error { code: String, message: String },

    /// The server is closing the connection
    Kicked { reason: String },
}

impl ServerMessage {
    /// Creates an error message.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Creates a kick message.
    pub fn kicked(reason: &str) -> Self {
        Self::Kicked {
            reason: reason.to_string(),
        }
    }

    /// Serializes the message as one protocol line, newline included.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}
