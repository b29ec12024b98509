//! Election error types

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Election-specific error types
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Lease {0} already exists")]
    AlreadyExists(String),

    #[error("Lease {0} was modified concurrently")]
    Conflict(String),

    #[error("Invalid election state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ElectionError {
    pub fn configuration<T: Into<String>>(msg: T) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn unavailable<T: Into<String>>(msg: T) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn already_exists<T: Into<String>>(key: T) -> Self {
        Self::AlreadyExists(key.into())
    }

    pub fn conflict<T: Into<String>>(key: T) -> Self {
        Self::Conflict(key.into())
    }

    pub fn invalid_state<T: Into<String>>(msg: T) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Another candidate won the write. Expected under contention, not a fault.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::AlreadyExists(_) | Self::Conflict(_))
    }

    /// Transient failure the loops retry on the next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

impl From<sled::Error> for ElectionError {
    fn from(err: sled::Error) -> Self {
        Self::unavailable(format!("Sled error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ElectionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::unavailable("backend call timed out")
    }
}

#[cfg(feature = "kubernetes")]
impl From<kube::Error> for ElectionError {
    fn from(err: kube::Error) -> Self {
        Self::unavailable(format!("Kubernetes API error: {}", err))
    }
}
