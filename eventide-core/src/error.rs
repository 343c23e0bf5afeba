//! # Error Handling
//!
//! Error types shared by every Eventide component.
//!
//! Absence is not an error: a stream with no events reports
//! [`NO_VERSION`](crate::types::NO_VERSION) and metadata lookups return
//! `Option`. Errors are reserved for protocol misuse, concurrency conflicts,
//! storage failures and corrupt data.

use thiserror::Error;

/// Result type alias for Eventide operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for Eventide
#[derive(Error, Debug)]
pub enum Error {
    // Programmer errors
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    // Concurrency
    #[error("Version conflict on stream {stream:#018x}: expected {expected}, actual {actual}")]
    VersionConflict { stream: u64, expected: i32, actual: i32 },

    #[error("Stream already exists: {name} ({hash:#018x})")]
    StreamExists { name: String, hash: u64 },

    // Storage
    #[error("Segment error: {message}")]
    Segment { message: String, source: Option<Box<dyn std::error::Error + Send + Sync>> },

    #[error("Compaction failed: {reason}")]
    Compaction { reason: String },

    #[error("Corrupt data detected: {details}")]
    CorruptData { details: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    // System
    #[error("IO error: {message}")]
    Io { message: String, source: std::io::Error },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Shorthand for a [`Error::ProtocolViolation`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::ProtocolViolation { message: message.into() }
    }

    /// Shorthand for a [`Error::CorruptData`].
    pub fn corrupt(details: impl Into<String>) -> Self {
        Error::CorruptData { details: details.into() }
    }

    /// Check if error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::VersionConflict { .. } => true,
            Error::StreamExists { .. } => true,
            Error::Compaction { .. } => true,
            _ => false,
        }
    }

    /// Get error code for monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::StreamExists { .. } => "STREAM_EXISTS",
            Error::Segment { .. } => "SEGMENT_ERROR",
            Error::Compaction { .. } => "COMPACTION_ERROR",
            Error::CorruptData { .. } => "CORRUPT_DATA",
            Error::Codec { .. } => "CODEC_ERROR",
            Error::Io { .. } => "IO_ERROR",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

// Conversion from std::io::Error
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::CorruptData {
            details: format!("json: {}", err),
        }
    }
}

/// Extension trait for adding context to results
pub trait ResultExt<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| match e {
            // Keep the variant so callers can still match on conflicts
            Error::VersionConflict { .. } | Error::ProtocolViolation { .. } => e,
            other => Error::Internal {
                message: format!("{}: {}", f(), other),
            },
        })
    }
}
