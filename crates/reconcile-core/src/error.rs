//! Remote store errors
//!
//! Faults returned by the orchestration API, classified so reconcilers can
//! treat the expected ones ("not found" during get-or-create, "already
//! exists" on a racing create) as ordinary branches.

use thiserror::Error;

/// Errors that can occur when talking to the resource store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist (HTTP 404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create raced with another writer (HTTP 409, reason `AlreadyExists`)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Write conflicted with a concurrent update (HTTP 409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Watch cursor is too old to resume from (HTTP 410)
    #[error("Resource version expired: {0}")]
    Gone(String),

    /// Any other status returned by the API server
    #[error("API error ({code}): {message}")]
    Api {
        /// HTTP status code
        code: u16,
        /// Server supplied message
        message: String,
    },

    /// Transport, TLS or client-side failure
    #[error("Kubernetes error: {0}")]
    Kube(#[source] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the fault means the watch cursor must be discarded.
    pub fn is_gone(&self) -> bool {
        matches!(self, Self::Gone(_))
    }

    /// True for the 404 branch.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound(ae.message.clone()),
                409 if ae.reason == "AlreadyExists" => Self::AlreadyExists(ae.message.clone()),
                409 => Self::Conflict(ae.message.clone()),
                410 => Self::Gone(ae.message.clone()),
                code => Self::Api {
                    code,
                    message: ae.message.clone(),
                },
            },
            other => Self::Kube(other),
        }
    }
}
