//! Errors surfaced by the coordinators.
//!
//! Internal helpers work with `anyhow::Result` and attach context; the
//! coordinators map those failures onto a [`CoreError`] kind at their public
//! boundary, keeping the full context chain in the message.

use thiserror::Error;
use tunnel_crypto::SessionError;

#[derive(Debug, Error)]
pub enum CoreError {
    /// `start` was called while an engine is live
    #[error("tunnel engine is already running")]
    AlreadyRunning,

    /// Configuration failed to parse or commit
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to open datastore: {0}")]
    StoreOpenFailed(String),

    #[error("failed to construct tunnel engine: {0}")]
    EngineConstructFailed(String),

    /// Bootstrap candidate import failed. Reported through notices only.
    #[error("candidate import failed: {0}")]
    ImportFailed(String),

    #[error("feedback upload failed: {0}")]
    FeedbackFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The embedding facade was used before `embed::install`
    #[error("tunnel core is not installed")]
    NotInstalled,

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl CoreError {
    /// Render an `anyhow` error with its whole context chain.
    pub(crate) fn chain(err: &anyhow::Error) -> String {
        format!("{err:#}")
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
