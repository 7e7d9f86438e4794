//! Error types for the FleetGrid state stores.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("unknown host: {0}")]
    HostNotFound(String),

    #[error("app not configured: {name} version {version}")]
    AppNotFound { name: String, version: String },

    #[error("no needs recorded for {name} version {version}")]
    NeedsNotFound { name: String, version: String },

    #[error("configuration for {name} version {version} already exists with different content")]
    ImmutableVersion { name: String, version: String },
}
