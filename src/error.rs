//! Engine error taxonomy.
//!
//! Every operation exposed to collaborators returns [`Error`]. Callers map the
//! variants to their own status codes without inspecting driver details:
//!
//! - [`Error::Backend`]: storage engine unreachable or misconfigured
//! - [`Error::NotFound`] / [`Error::Expired`]: expected lookup misses
//! - [`Error::CorruptPayload`]: a stored payload no longer deserializes
//! - [`Error::InvalidInput`]: rejected before storage is touched

use crate::backend::BackendError;

/// Result alias for engine operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage backend failure: {0}")]
    Backend(#[from] BackendError),

    #[error("no matching row")]
    NotFound,

    #[error("row has expired")]
    Expired,

    #[error("stored payload is corrupt: {0}")]
    CorruptPayload(#[source] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// True for the recoverable "nothing usable here" outcomes.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::NotFound | Self::Expired)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
