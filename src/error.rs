//! Error types for helmsman

/// Result type alias for helmsman operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for helmsman
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Coordination store errors
    #[error("Coordination error: {0}")]
    Coord(#[from] CoordError),
    /// A znode payload field failed strict parsing
    #[error("Payload parse error: key {key} has invalid value {value:?}")]
    PayloadParse { key: String, value: String },
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors surfaced by the coordination client.
///
/// `NodeExists` is deliberately distinguished: on the prepare and migration
/// paths it means "someone else holds the lock", which callers treat as a soft
/// failure, while every other variant means the store itself misbehaved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CoordError {
    /// Create target already exists
    #[error("znode already exists")]
    NodeExists,
    /// Read/write/delete target does not exist
    #[error("znode not found")]
    NoNode,
    /// Delete target still has children
    #[error("znode has children")]
    NotEmpty,
    /// The session is not connected
    #[error("not connected to coordination service")]
    NotConnected,
    /// The session was expired by the coordination service
    #[error("coordination session expired")]
    SessionExpired,
}

impl Error {
    /// True when the error is the distinguished "lock already held" case.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Coord(CoordError::NodeExists))
    }
}
