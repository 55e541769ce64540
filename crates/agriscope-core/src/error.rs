//! Error taxonomy for the collaboration engine.

use thiserror::Error;

/// Errors raised by the collaboration engine.
///
/// Validation and state errors are raised before any state mutation
/// (validate-then-apply, never apply-then-rollback).
#[derive(Debug, Error)]
pub enum CollabError {
    /// Malformed or out-of-range payload, rejected at the ingress boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown session, annotation, tool, or drawing state.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Drawing lifecycle violation (continue/finish without a start).
    #[error("invalid drawing state: {0}")]
    InvalidState(String),

    /// Serialization failure at the wire boundary.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl CollabError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CollabError::NotFound { entity, id: id.into() }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Serialization(err.to_string())
    }
}

/// Result type for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;
