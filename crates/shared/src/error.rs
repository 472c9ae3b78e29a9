//! Error types for LineDesk

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LineDeskError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
