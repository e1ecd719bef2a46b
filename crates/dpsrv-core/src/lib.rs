//! dpsrv core - shared types for the collaborative drawing server
//!
//! This crate provides the domain types used by the server (dpsrvd):
//! session identifiers, the lifecycle state machine, recording path
//! resolution, configuration, and the lobby wire messages.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod message;
pub mod recording;
pub mod session;
pub mod state;

// Re-exports for convenience
pub use config::{BanEntry, BanList, ConfigError, ConfigStore, ServerConfig, DEFAULT_PORT};
pub use error::{DomainError, DomainResult};
pub use message::{ClientMessage, ServerMessage};
pub use recording::{resolve_recording_path, RecordingPattern, DEFAULT_RECORDING_PATTERN};
pub use session::{SessionId, UserId};
pub use state::{ServerState, StateError};
