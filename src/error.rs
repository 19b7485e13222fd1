//! Error types for the directory operator

use thiserror::Error;

/// Main error type for directory operator operations
///
/// Every error carries its own retryability (see [`Error::is_retryable`]).
/// Lower layers never decide whether to requeue; the reconciler does.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Malformed or conflicting configuration, or an unsafe request
    #[error("validation error: {0}")]
    Validation(String),

    /// A bounded wait ran past its ceiling
    #[error("timeout: {0}")]
    Timeout(String),

    /// The reconciliation pass was cancelled while waiting
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// An administrative command inside a replica failed
    #[error("command error: {0}")]
    Command(String),

    /// Directory protocol error while talking to the proxy
    #[error("directory error: {0}")]
    Directory(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a cancellation error with the given message
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a command error with the given message
    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    /// Create a directory protocol error with the given message
    pub fn directory(msg: impl Into<String>) -> Self {
        Self::Directory(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failed pass should be requeued.
    ///
    /// Validation and serialization failures need a document change to
    /// succeed; everything else may clear up on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::Serialization(_))
    }

    /// Returns true if this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// Message suitable for a status condition or admission denial
    ///
    /// Validation failures are surfaced verbatim without the category prefix.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
