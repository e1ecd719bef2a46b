//! Server configuration.
//!
//! Configuration is read from a TOML file. Every key is optional:
//!
//! ```toml
//! listen = "0.0.0.0"
//! port = 27750
//! ssl_cert = "/etc/dpsrv/cert.pem"
//! ssl_key = "/etc/dpsrv/key.pem"
//! must_secure = false
//! auto_stop = false
//! recording_path = "~/recordings/%d %t session %i.dprec"
//! announce_local_addr = "draw.example.com"
//! banned = ["192.0.2.7", "10.0.0.0/8", "2001:db8::/32"]
//!
//! [users]
//! alice = "hunter2"
//! ```
//!
//! The lifecycle controller only sees the [`ConfigStore`] trait.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::DomainError;
use crate::recording::RecordingPattern;

/// Default listening port.
pub const DEFAULT_PORT: u16 = 27750;

/// Configuration values the server consults at runtime.
pub trait ConfigStore: Send + Sync {
    /// The recording file name pattern (empty disables recording).
    fn recording_path(&self) -> RecordingPattern;

    /// Returns true if connections from `addr` must be rejected.
    fn is_address_banned(&self, addr: IpAddr) -> bool;
}

// ============================================================================
// Server Configuration
// ============================================================================

/// Server configuration as loaded from the TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen: IpAddr,

    /// Port to listen on
    pub port: u16,

    /// TLS certificate chain (PEM)
    pub ssl_cert: Option<PathBuf>,

    /// TLS private key (PEM)
    pub ssl_key: Option<PathBuf>,

    /// Refuse logins over unencrypted connections
    pub must_secure: bool,

    /// Stop once the last session and user are gone
    pub auto_stop: bool,

    /// Recording file name pattern
    pub recording_path: RecordingPattern,

    /// Address advertised to the session listing server
    pub announce_local_addr: Option<String>,

    /// Banned addresses and networks
    pub banned: BanList,

    /// Registered users (username -> password)
    pub users: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::from([0, 0, 0, 0]),
            port: DEFAULT_PORT,
            ssl_cert: None,
            ssl_key: None,
            must_secure: false,
            auto_stop: false,
            recording_path: RecordingPattern::default(),
            announce_local_addr: None,
            banned: BanList::default(),
            users: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Io` if the file cannot be read
    /// - `ConfigError::Parse` if the contents are not valid configuration
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Returns the certificate and key paths if both are configured.
    pub fn tls_files(&self) -> Option<(&Path, &Path)> {
        match (&self.ssl_cert, &self.ssl_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

impl ConfigStore for ServerConfig {
    fn recording_path(&self) -> RecordingPattern {
        self.recording_path.clone()
    }

    fn is_address_banned(&self, addr: IpAddr) -> bool {
        self.banned.contains(addr)
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

// ============================================================================
// Ban List
// ============================================================================

/// A banned address or network, written as `addr` or `addr/prefix`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BanEntry {
    addr: IpAddr,
    prefix: u8,
}

impl BanEntry {
    /// Creates an entry, validating the prefix length for the address family.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, DomainError> {
        let max = max_prefix(addr);
        if prefix > max {
            return Err(DomainError::InvalidFieldValue {
                field: "prefix".to_string(),
                value: prefix.to_string(),
                expected: format!("0..={max}"),
            });
        }
        Ok(Self {
            addr: addr.to_canonical(),
            prefix,
        })
    }

    /// Returns true if `addr` falls inside this entry.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.addr, addr.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn max_prefix(addr: IpAddr) -> u8 {
    match addr.to_canonical() {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

impl FromStr for BanEntry {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };

        let addr: IpAddr = addr
            .parse()
            .map_err(|e| DomainError::parse("banned address", format!("{s}: {e}")))?;
        let prefix = match prefix {
            Some(p) => p
                .parse()
                .map_err(|e| DomainError::parse("banned prefix", format!("{s}: {e}")))?,
            None => max_prefix(addr),
        };

        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for BanEntry {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<BanEntry> for String {
    fn from(entry: BanEntry) -> Self {
        entry.to_string()
    }
}

impl fmt::Display for BanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.prefix == max_prefix(self.addr) {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.prefix)
        }
    }
}

/// The set of banned addresses.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BanList(Vec<BanEntry>);

impl BanList {
    pub fn new(entries: Vec<BanEntry>) -> Self {
        Self(entries)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.0.iter().any(|entry| entry.contains(addr))
    }

    pub fn push(&mut self, entry: BanEntry) {
        self.0.push(entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
