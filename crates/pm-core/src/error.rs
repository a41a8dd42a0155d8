//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid field value
    #[error("Invalid {field}: {value:?} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DomainError::InvalidFieldValue {
            field: "command".to_string(),
            value: String::new(),
            expected: "non-empty command".to_string(),
        };
        assert!(err.to_string().contains("command"));
    }
}
