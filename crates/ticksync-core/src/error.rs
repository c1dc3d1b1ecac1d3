//! Error types for ticksync-core

use thiserror::Error;

use crate::config::ConfigError;
use crate::contract::ContractError;
use crate::models::SessionStatus;

/// Result type alias using ticksync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ticksync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record or session not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Record type is not in the sync registry
    #[error("Unknown record type: {0}")]
    UnknownRecordType(String),

    /// Sync contract registration failed
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// Configuration could not be loaded
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Session lifecycle violation
    #[error("Sync session '{session_id}' cannot move from {from} to {to}")]
    InvalidSessionTransition {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },

    /// Session is already completed and can no longer change
    #[error("Sync session '{0}' is already completed")]
    SessionCompleted(String),

    /// Session failed; the message is the latest recorded error
    #[error("Sync session '{session_id}' encountered an error: {message}")]
    SessionErrored { session_id: String, message: String },

    /// A pushed record belongs to a type that only flows from central
    #[error("Record type '{0}' cannot be pushed to central")]
    PushNotAllowed(String),
}
