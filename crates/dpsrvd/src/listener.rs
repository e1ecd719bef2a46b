//! Listening socket, plain TCP or TLS.
//!
//! The transport is chosen once, when the listener is created: if both a
//! certificate and a key are configured the listener is TLS-capable,
//! otherwise it is plain TCP. The listener either binds an address itself
//! ([`Listener::start`]) or adopts a descriptor handed over by a process
//! manager ([`Listener::start_from_descriptor`]).
//!
//! The TLS handshake is not performed here. Accepted streams are handed out
//! raw together with the acceptor so the handshake runs in the client's own
//! task.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{IpAddr, SocketAddr};
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Errors that can occur while setting up the listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Invalid TLS certificate or key {path}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't use socket descriptor {fd}: {reason}")]
    Descriptor { fd: RawFd, reason: String },
}

/// How accepted connections are secured.
#[derive(Clone)]
enum Transport {
    Plain,
    Tls(TlsAcceptor),
}

/// A listening socket, plain or TLS.
pub struct Listener {
    transport: Transport,
    socket: Option<TcpListener>,
}

impl Listener {
    /// Creates a listener, TLS-capable when both certificate and key are given.
    ///
    /// # Errors
    ///
    /// `ListenerError::InvalidCertificate` if the certificate/key pair cannot
    /// be loaded or does not form a usable server identity.
    pub fn create(tls_files: Option<(&Path, &Path)>) -> Result<Self, ListenerError> {
        match tls_files {
            Some((cert, key)) => Self::tls(cert, key),
            None => Ok(Self::plain()),
        }
    }

    /// Creates a plain TCP listener.
    pub fn plain() -> Self {
        Self {
            transport: Transport::Plain,
            socket: None,
        }
    }

    /// Creates a TLS listener from PEM certificate chain and key files.
    pub fn tls(cert_path: &Path, key_path: &Path) -> Result<Self, ListenerError> {
        let acceptor = load_tls_acceptor(cert_path, key_path)?;
        Ok(Self {
            transport: Transport::Tls(acceptor),
            socket: None,
        })
    }

    /// Binds `address:port` and starts listening.
    pub async fn start(&mut self, address: IpAddr, port: u16) -> Result<(), ListenerError> {
        let addr = SocketAddr::new(address, port);
        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;
        self.socket = Some(socket);
        Ok(())
    }

    /// Adopts an already listening socket descriptor.
    ///
    /// On success the listener owns the descriptor and closes it when
    /// closed or dropped.
    pub fn start_from_descriptor(&mut self, fd: RawFd) -> Result<(), ListenerError> {
        let descriptor_error = |reason: String| ListenerError::Descriptor { fd, reason };

        check_listening_socket(fd).map_err(|e| descriptor_error(e.to_string()))?;

        // SAFETY: the descriptor was verified to be an open listening socket
        // and is handed to us by the process manager; nothing else in this
        // process owns it.
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        std_listener
            .set_nonblocking(true)
            .map_err(|e| descriptor_error(e.to_string()))?;
        let socket =
            TcpListener::from_std(std_listener).map_err(|e| descriptor_error(e.to_string()))?;

        self.socket = Some(socket);
        Ok(())
    }

    /// Waits for the next incoming connection.
    ///
    /// Returns an error if the listener is not listening.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.socket {
            Some(socket) => socket.accept().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    /// Closes the listening socket. Closing twice is harmless.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("Listening socket closed");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.socket.is_some()
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.transport, Transport::Tls(_))
    }

    /// TLS acceptor for accepted streams, if this is a TLS listener.
    pub fn acceptor(&self) -> Option<TlsAcceptor> {
        match &self.transport {
            Transport::Tls(acceptor) => Some(acceptor.clone()),
            Transport::Plain => None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }
}

/// Loads a certificate chain and private key into a TLS acceptor.
fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, ListenerError> {
    let invalid = |path: &Path, reason: String| ListenerError::InvalidCertificate {
        path: path.to_path_buf(),
        reason,
    };

    let cert_file = File::open(cert_path).map_err(|e| invalid(cert_path, e.to_string()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(cert_path, e.to_string()))?;
    if certs.is_empty() {
        return Err(invalid(cert_path, "no certificates found".to_string()));
    }

    let key_file = File::open(key_path).map_err(|e| invalid(key_path, e.to_string()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| invalid(key_path, e.to_string()))?
        .ok_or_else(|| invalid(key_path, "no private key found".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| invalid(cert_path, e.to_string()))?;

    info!(cert = %cert_path.display(), "Loaded TLS certificate");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Verifies that `fd` is an open socket in the listening state.
fn check_listening_socket(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFD only queries descriptor flags.
    if unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        return Err(io::Error::last_os_error());
    }

    let mut accepting: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the out pointers reference live locals sized for SO_ACCEPTCONN.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ACCEPTCONN,
            (&mut accepting as *mut libc::c_int).cast(),
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    if accepting == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket is not listening",
        ));
    }
    Ok(())
}
