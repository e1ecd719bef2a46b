//! Per-client handler task.
//!
//! Each admitted client gets its own task that:
//! - Completes the TLS handshake (if the listener is TLS)
//! - Parses lobby messages and routes them to the shared registry state
//! - Honours kick requests from the registry
//! - Removes the client from the registry when the connection ends
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in a disconnect

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tracing::{debug, info};

use dpsrv_core::message::{ERROR_BAD_MESSAGE, ERROR_BAD_PASSWORD, ERROR_MUST_SECURE, KICK_SHUTDOWN};
use dpsrv_core::{ClientMessage, ServerMessage, SessionId, UserId};

use super::session_server::Shared;
use super::IdentityResult;
use crate::client::{send_message, Client, ClientError, ClientStream};

/// Maximum length of one protocol line (64 KiB).
const MAX_LINE_LENGTH: usize = 65_536;

/// What to do with the connection after handling a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Serves one client until it disconnects or is kicked.
pub(super) async fn serve_client(shared: Arc<Shared>, client: Client, kick: oneshot::Receiver<String>) {
    let user_id = client.id();
    let peer = client.peer_addr();
    let secure = client.is_secure();

    let result = match client.establish().await {
        Ok(stream) => {
            ClientHandler::new(Arc::clone(&shared), user_id, secure, stream)
                .run(kick)
                .await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        debug!(user = %user_id, peer = %peer, error = %e, "Connection closed with error");
    }

    shared.remove_client(user_id);
    info!(user = %user_id, peer = %peer, "Client disconnected");
}

struct ClientHandler {
    shared: Arc<Shared>,
    user_id: UserId,
    secure: bool,
    reader: BufReader<ReadHalf<ClientStream>>,
    writer: WriteHalf<ClientStream>,
}

impl ClientHandler {
    fn new(shared: Arc<Shared>, user_id: UserId, secure: bool, stream: ClientStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            shared,
            user_id,
            secure,
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn run(mut self, mut kick: oneshot::Receiver<String>) -> Result<(), ClientError> {
        loop {
            let mut line = String::new();

            tokio::select! {
                reason = &mut kick => {
                    let reason = reason.unwrap_or_else(|_| KICK_SHUTDOWN.to_string());
                    debug!(user = %self.user_id, reason = %reason, "Kicking client");
                    self.send(ServerMessage::kicked(&reason)).await?;
                    self.writer.shutdown().await?;
                    return Ok(());
                }

                read = read_line(&mut self.reader, &mut line) => {
                    if read? == 0 {
                        return Ok(());
                    }
                }
            }

            self.apply_random_lag().await;

            if self.handle_line(&line).await? == Flow::Close {
                self.writer.shutdown().await?;
                return Ok(());
            }
        }
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow, ClientError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }

        let message = match serde_json::from_str::<ClientMessage>(line) {
            Ok(message) => message,
            Err(e) => {
                self.send(ServerMessage::error(ERROR_BAD_MESSAGE, e.to_string()))
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        match message {
            ClientMessage::Login { username, password } => {
                self.handle_login(username, password).await
            }
            ClientMessage::Host { title } => {
                let reply = match self.shared.host(self.user_id, title) {
                    Ok(session) => ServerMessage::Joined { session },
                    Err(e) => ServerMessage::error(e.code(), e.to_string()),
                };
                self.send(reply).await?;
                Ok(Flow::Continue)
            }
            ClientMessage::Join { session } => self.handle_join(session).await,
        }
    }

    async fn handle_login(
        &mut self,
        username: String,
        password: Option<String>,
    ) -> Result<Flow, ClientError> {
        let settings = self.shared.settings();

        if settings.must_secure && !self.secure {
            self.send(ServerMessage::error(
                ERROR_MUST_SECURE,
                "This server requires a secure connection",
            ))
            .await?;
            return Ok(Flow::Close);
        }

        if let Some(identities) = &settings.identities {
            if identities.check_login(&username, password.as_deref()) == IdentityResult::BadPassword
            {
                info!(user = %self.user_id, username = %username, "Login refused: bad password");
                self.send(ServerMessage::error(ERROR_BAD_PASSWORD, "Incorrect password"))
                    .await?;
                return Ok(Flow::Continue);
            }
        }

        let reply = match self.shared.login(self.user_id, username) {
            Ok(()) => ServerMessage::LoggedIn {
                user_id: self.user_id,
            },
            Err(e) => ServerMessage::error(e.code(), e.to_string()),
        };
        self.send(reply).await?;
        Ok(Flow::Continue)
    }

    async fn handle_join(&mut self, session: SessionId) -> Result<Flow, ClientError> {
        let reply = match self.shared.join(self.user_id, session) {
            Ok(()) => ServerMessage::Joined { session },
            Err(e) => ServerMessage::error(e.code(), e.to_string()),
        };
        self.send(reply).await?;
        Ok(Flow::Continue)
    }

    async fn apply_random_lag(&self) {
        let lag = self.shared.settings().random_lag;
        if lag.is_zero() {
            return;
        }
        let max_ms = u64::try_from(lag.as_millis()).unwrap_or(u64::MAX);
        let delay = rand::random_range(0..=max_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    async fn send(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        send_message(&mut self.writer, &message).await
    }
}

/// Reads one line, refusing lines longer than `MAX_LINE_LENGTH`.
async fn read_line(
    reader: &mut BufReader<ReadHalf<ClientStream>>,
    line: &mut String,
) -> Result<usize, ClientError> {
    let limit = MAX_LINE_LENGTH as u64 + 1;
    let n = (&mut *reader).take(limit).read_line(line).await?;
    if n > MAX_LINE_LENGTH {
        return Err(ClientError::LineTooLong {
            max: MAX_LINE_LENGTH,
        });
    }
    Ok(n)
}
