//! Status reporting.
//!
//! A one-line summary of the user and session counts is pushed to a status
//! sink whenever the population changes. Reporting is best-effort: sink
//! failures are logged at debug level and never reach the caller.

use std::io;

use tracing::debug;

use dpsrv_core::ServerState;

/// Destination for status notifications.
pub trait StatusSink: Send + Sync {
    /// Publishes a human-readable status line.
    fn notify_status(&self, text: &str) -> io::Result<()>;

    /// Publishes a lifecycle change. Sinks that don't track lifecycle ignore it.
    fn notify_state(&self, _state: ServerState) -> io::Result<()> {
        Ok(())
    }
}

/// Sink that writes status lines to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn notify_status(&self, text: &str) -> io::Result<()> {
        debug!(status = %text, "Status update");
        Ok(())
    }
}

/// Formats and forwards status summaries to a sink.
pub struct StatusReporter {
    sink: Box<dyn StatusSink>,
}

impl Default for StatusReporter {
    fn default() -> Self {
        Self::new(Box::new(LogStatusSink))
    }
}

impl StatusReporter {
    pub fn new(sink: Box<dyn StatusSink>) -> Self {
        Self { sink }
    }

    /// Reports the current user and session counts.
    pub fn report(&self, users: usize, sessions: usize) {
        let text = format_status(users, sessions);
        if let Err(e) = self.sink.notify_status(&text) {
            debug!(error = %e, "Failed to publish status");
        }
    }

    /// Reports a lifecycle state change.
    pub fn state_changed(&self, state: ServerState) {
        if let Err(e) = self.sink.notify_state(state) {
            debug!(error = %e, state = %state, "Failed to publish state change");
        }
    }
}

/// Builds the status summary line.
pub fn format_status(users: usize, sessions: usize) -> String {
    format!("{users} users and {sessions} sessions")
}
