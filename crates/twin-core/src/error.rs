//! Error types shared by every twin crate.

use thiserror::Error;

/// Result type for twin operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which side of a declared range a value fell outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeBound {
    /// Value is below the declared minimum.
    Min(i64),
    /// Value is above the declared maximum.
    Max(i64),
}

impl std::fmt::Display for RangeBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RangeBound::Min(min) => write!(f, "below minimum allowed {}", min),
            RangeBound::Max(max) => write!(f, "above maximum allowed {}", max),
        }
    }
}

/// Input rejected before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing identifier")]
    MissingIdentifier,

    #[error("missing field name")]
    MissingFieldName,

    #[error("invalid value '{value}' for {field}: {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("value {value} for {field} {bound}")]
    OutOfRange {
        field: String,
        value: i64,
        bound: RangeBound,
    },

    #[error("string too long for {field}, length: {len}, allowed: {max}")]
    TooLong { field: String, len: usize, max: usize },
}

/// Twin error types.
#[derive(Debug, Error)]
pub enum Error {
    /// Caller supplied bad input.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown field, missing firmware schema, unknown token and similar.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed binary payload from a device.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Schema entry that cannot be mapped to a value type.
    #[error("Invalid schema: {0}")]
    Schema(String),

    /// Persistent store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Outbound transport or remote collaborator failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Token rejected or role not allowed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A collaborator call exceeded its deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if the error was caused by caller input.
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Check if the error comes from an unreachable or failing collaborator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Transport(_) | Error::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
