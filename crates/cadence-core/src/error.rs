//! Error types for cadence

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CadenceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl CadenceError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound { kind, id: id.to_string() }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
