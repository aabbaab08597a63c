//! Published error taxonomy for the updater.
//!
//! Operations run on `anyhow::Result` internally; at the command-dispatch
//! boundary every failure is normalized into this taxonomy before it is
//! surfaced as an attribute error.

use thiserror::Error;

/// Errors surfaced through the update entity.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Unknown(String),
}

impl UpdaterError {
    /// Wire-level error code for the published attribute error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        }
    }

    /// Normalize an operation failure into the published taxonomy.
    ///
    /// Errors that are already part of the taxonomy pass through unchanged;
    /// everything else is wrapped as `UNKNOWN_ERROR` with its display form
    /// as the message.
    pub fn normalize(error: anyhow::Error) -> Self {
        match error.downcast::<UpdaterError>() {
            Ok(err) => err,
            Err(other) => Self::Unknown(other.to_string()),
        }
    }
}
