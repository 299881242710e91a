use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid blob id {id:?}: {reason}")]
    InvalidBlobId { id: String, reason: &'static str },

    #[error("unknown lifecycle state tag: {0}")]
    UnknownState(u8),

    #[error("unknown lifecycle state name: {0}")]
    UnknownStateName(String),
}
