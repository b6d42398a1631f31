//! Validation errors for value objects

use thiserror::Error;

/// Value object validation failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// Feature key failed validation
    #[error("invalid feature key: {0}")]
    InvalidFeatureKey(String),

    /// Payment reference failed validation
    #[error("invalid payment reference: {0}")]
    InvalidPaymentReference(String),

    /// Identifier could not be parsed
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Token amount is negative, too precise or out of range
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
}

/// Result type for value object construction
pub type DomainResult<T> = Result<T, DomainError>;
