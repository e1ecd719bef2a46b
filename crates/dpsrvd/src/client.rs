//! Client connection handle.
//!
//! A [`Client`] is an accepted TCP connection that has not been exposed to
//! any session logic yet. It is either handed to the session registry or
//! kicked straight away (banned peers).
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Kick failures are logged at debug level, the peer is gone anyway

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use dpsrv_core::{ServerMessage, UserId};

/// Maximum time allowed for a TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Write timeout for a single protocol line.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream of an established client connection, plain or TLS.
pub trait ClientIo: AsyncRead + AsyncWrite + Unpin + Send + Sync {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync> ClientIo for T {}

/// Boxed client stream.
pub type ClientStream = Box<dyn ClientIo>;

/// Errors on an individual client connection.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(io::Error),

    #[error("TLS handshake timed out")]
    HandshakeTimeout,

    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Line too long (max: {max} bytes)")]
    LineTooLong { max: usize },
}

/// An accepted, not yet admitted client connection.
pub struct Client {
    id: UserId,
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Client {
    /// Wraps an accepted stream. `tls` is set when the listener is TLS.
    pub fn new(id: UserId, stream: TcpStream, peer: SocketAddr, tls: Option<TlsAcceptor>) -> Self {
        Self {
            id,
            stream,
            peer,
            tls,
        }
    }

    pub fn id(&self) -> UserId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Returns true if the connection will be encrypted.
    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Completes the TLS handshake (if any) and returns the usable stream.
    pub async fn establish(self) -> Result<ClientStream, ClientError> {
        match self.tls {
            None => Ok(Box::new(self.stream)),
            Some(acceptor) => {
                let tls = timeout(HANDSHAKE_TIMEOUT, acceptor.accept(self.stream))
                    .await
                    .map_err(|_| ClientError::HandshakeTimeout)?
                    .map_err(ClientError::Handshake)?;
                Ok(Box::new(tls))
            }
        }
    }

    /// Sends a kick notice with `reason` and closes the connection.
    ///
    /// Runs in its own task; the caller never waits on the peer.
    pub fn disconnect_kick(self, reason: &str) {
        let message = ServerMessage::kicked(reason);
        let peer = self.peer;

        tokio::spawn(async move {
            let result = async {
                let mut stream = self.establish().await?;
                send_message(&mut stream, &message).await?;
                stream.shutdown().await?;
                Ok::<(), ClientError>(())
            }
            .await;

            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Failed to deliver kick notice");
            }
        });
    }
}

/// Writes one protocol line to the stream.
pub async fn send_message<W>(writer: &mut W, message: &ServerMessage) -> Result<(), ClientError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let line = message.to_line()?;
    timeout(WRITE_TIMEOUT, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "write timed out"))??;
    Ok(())
}
