//! Session and user identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identifier of a collaborative session.
///
/// Allocated sequentially by the session registry. The textual form is the
/// plain decimal number, which is also what `%i` expands to in recording
/// file patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u32);

impl SessionId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the following identifier, wrapping past `u32::MAX` to 1.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0.checked_add(1) {
            Some(n) => Self(n),
            None => Self(1),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SessionId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl FromStr for SessionId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse()
            .map(Self)
            .map_err(|e| DomainError::parse("session id", e))
    }
}

/// Identifier of a connected client (a "user" once admitted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(u64);

impl UserId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_display_is_plain_decimal() {
        assert_eq!(SessionId::new(7).to_string(), "7");
        assert_eq!(SessionId::new(1234).to_string(), "1234");
    }

    #[test]
    fn test_session_id_next_wraps_to_one() {
        assert_eq!(SessionId::new(1).next(), SessionId::new(2));
        assert_eq!(SessionId::new(u32::MAX).next(), SessionId::new(1));
    }

    #[test]
    fn test_session_id_from_str() {
        assert_eq!(" 42 ".parse::<SessionId>().unwrap(), SessionId::new(42));
        assert!("abc".parse::<SessionId>().is_err());
    }

    #[test]
    fn test_session_id_serializes_transparently() {
        let json = serde_json::to_string(&SessionId::new(5)).unwrap();
        assert_eq!(json, "5");
    }

    #[test]
    fn test_user_id_display() {
        assert_eq!(UserId::new(3).to_string(), "#3");
    }
}
