//! Snapback Error Types

use thiserror::Error;

/// Result type alias for Snapback operations
pub type Result<T> = std::result::Result<T, Error>;

/// Snapback error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Peer errors
    #[error("Peer {endpoint} unavailable: {reason}")]
    TransientPeer { endpoint: String, reason: String },

    #[error("Request to {0} timed out")]
    PeerTimeout(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Reconciliation errors
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Insufficient replicas: selected {selected}/{needed} after {attempts} attempts")]
    InsufficientReplicas {
        selected: usize,
        needed: usize,
        attempts: u32,
    },

    #[error("Assignment authority write failed for user {user_id}: {reason}")]
    AuthorityWrite { user_id: u64, reason: String },

    #[error("Batch partially failed: {failed}/{total} operations")]
    BatchPartialFailure { failed: usize, total: usize },

    // Sync errors
    #[error("Manual syncs are disabled on this node")]
    ManualSyncsDisabled,

    #[error("Secondary {secondary} did not catch up for wallet {wallet} within {timeout_ms}ms")]
    SyncTimeout {
        secondary: String,
        wallet: String,
        timeout_ms: u64,
    },

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientPeer { .. } | Error::PeerTimeout(_) => true,
            Error::Http(e) => !e.is_decode() && !e.is_builder(),
            _ => false,
        }
    }

    /// Build a transient peer error
    pub fn peer(endpoint: &str, reason: impl std::fmt::Display) -> Self {
        Error::TransientPeer {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::State(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::peer("http://cn1", "connection reset").is_retryable());
        assert!(Error::PeerTimeout("http://cn1".into()).is_retryable());
        assert!(!Error::DataInconsistency("spID mismatch".into()).is_retryable());
        assert!(!Error::InsufficientReplicas { selected: 1, needed: 2, attempts: 100 }.is_retryable());
    }
}
