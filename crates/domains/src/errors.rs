//! # Domain Errors
//!
//! Failures surfaced across port boundaries. Rule evaluation itself never
//! fails; these cover lookups, persistence and outbound transport.

use thiserror::Error;

/// The primary error type for domain and service operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Referenced entity does not exist (e.g., path, SOI, lead)
    #[error("{entity} not found with ID {id}")]
    NotFound { entity: &'static str, id: String },

    /// Request is missing or carries invalid data
    #[error("validation error: {0}")]
    Validation(String),

    /// Persistence layer failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Pixel template could not be rendered
    #[error("render error: {0}")]
    Render(String),
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Outbound HTTP failure. Callers degrade these to a fallback outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// A specialized Result type for domain operations.
pub type Result<T> = std::result::Result<T, DomainError>;
