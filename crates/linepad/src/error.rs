//! Error types for the linepad crate.

use thiserror::Error;

/// A wire unit could not be turned into an envelope.
///
/// Malformed units are dropped one at a time; the stream they arrived on
/// keeps going. Only `Io` ends a connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The unit is not valid JSON, or a payload field is missing or invalid.
    #[error("Malformed message: {reason}")]
    MalformedMessage { reason: String },

    /// Transport failure while reading or writing frames.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Create a `MalformedMessage` error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    /// Whether this error only affects the unit it was raised for.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::MalformedMessage { .. })
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::malformed(e.to_string())
    }
}

/// Why a joining participant was turned away.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Empty or missing name, or an unreadable first unit.
    #[error("Invalid name")]
    Invalid,

    /// Another active session already uses the name.
    #[error("Name already taken: {name}")]
    Taken { name: String },
}

/// Errors raised by the connection registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// An active session already holds this exact name.
    #[error("Name already registered: {name}")]
    NameTaken { name: String },
}

impl From<RegistryError> for HandshakeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NameTaken { name } => HandshakeError::Taken { name },
        }
    }
}

/// Why an operation failed validation against the current document.
///
/// Rejections are never sent back to the submitting participant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The target line does not exist.
    #[error("Line {y} out of range (document has {line_count} lines)")]
    LineOutOfRange { y: i64, line_count: usize },

    /// The target column does not exist on the line.
    #[error("Column {x} out of range for line {y} (length {len})")]
    ColumnOutOfRange { x: i64, y: i64, len: usize },

    /// The first line has nothing to be joined onto.
    #[error("Cannot join line {y} onto a previous line")]
    NoPreviousLine { y: i64 },
}
