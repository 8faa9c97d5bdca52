//! Unified error handling for FleetMDM.
//!
//! Every crate in the workspace converts its local errors into this type at
//! its public boundary, so the transport layer only has to map one enum onto
//! protocol responses.

/// Unified error type for FleetMDM.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A device, push-info record or queue entry does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The persistent store failed. Callers (and devices) retry later.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Malformed input, or a command UUID that does not match the in-flight command.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A well-formed message this subsystem declines to handle
    /// (for example user-scoped check-ins).
    #[error("Protocol reject: {0}")]
    ProtocolReject(String),

    /// A check-in whose message type is not recognised.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// A stored push token is not structurally valid.
    #[error("Invalid push token: {0}")]
    InvalidToken(String),

    /// The push-send capability failed.
    #[error("Push error: {0}")]
    Push(String),

    /// Serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn protocol_reject(msg: impl Into<String>) -> Self {
        Self::ProtocolReject(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn push(msg: impl Into<String>) -> Self {
        Self::Push(msg.into())
    }

    /// Whether the caller should retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Push(_) | Self::Internal(_))
    }
}

#[macro_export]
macro_rules! not_found_err {
    ($msg:expr) => {
        $crate::error::Error::NotFound($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::NotFound(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! validation_err {
    ($msg:expr) => {
        $crate::error::Error::Validation($msg.into())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::Error::Validation(format!($fmt, $($arg)*))
    };
}

// Error conversion helpers
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(e.to_string())
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Error::Validation(e.to_string())
    }
}
