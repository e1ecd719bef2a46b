//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Creates a parse error for the named field.
    pub fn parse(field: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ParseError {
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_error_display() {
        let err = DomainError::InvalidFieldValue {
            field: "prefix".to_string(),
            value: "40".to_string(),
            expected: "0..=32".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid prefix: 40 (expected 0..=32)");

        let err = DomainError::parse("session id", "not a number");
        assert_eq!(err.to_string(), "Failed to parse session id: not a number");
    }
}
