//! User identity checks at login.

use std::collections::HashMap;

/// Outcome of checking a login against the identity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityResult {
    /// Username is not registered; log in as a guest
    Guest,
    /// Registered user with the correct password
    Authenticated,
    /// Registered user with a wrong or missing password
    BadPassword,
}

/// Source of registered user accounts.
pub trait IdentityManager: Send + Sync {
    fn check_login(&self, username: &str, password: Option<&str>) -> IdentityResult;
}

/// Identity manager backed by a fixed username -> password table.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentities {
    users: HashMap<String, String>,
}

impl StaticIdentities {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityManager for StaticIdentities {
    fn check_login(&self, username: &str, password: Option<&str>) -> IdentityResult {
        match self.users.get(username) {
            None => IdentityResult::Guest,
            Some(expected) if password == Some(expected.as_str()) => IdentityResult::Authenticated,
            Some(_) => IdentityResult::BadPassword,
        }
    }
}
