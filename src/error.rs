use thiserror::Error;

/// Main error type for the tether supervisor
#[derive(Debug, Error)]
pub enum TetherError {
    // Configuration errors
    #[error("Invalid configuration for field '{field}': {message}")]
    Config { field: String, message: String },

    #[error("Invalid configuration file: {0}")]
    InvalidConfig(String),

    // Process-related errors
    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App already running: {0}")]
    AlreadyRunning(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // IPC-related errors
    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Failed to connect to daemon: {0}")]
    ConnectionError(String),

    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    #[error("Daemon not running")]
    DaemonNotRunning,

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl TetherError {
    /// Build a configuration error that names the offending field
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        TetherError::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The descriptor field this error refers to, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            TetherError::Config { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Result type alias for tether operations
pub type Result<T> = std::result::Result<T, TetherError>;
