//! Error types for the fleet coordination library.

use thiserror::Error;

/// The main error type for the fleet library.
#[derive(Error, Debug)]
pub enum FleetError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store connection or command error.
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed cron expression.
    #[error("Cron error: {0}")]
    Cron(#[from] CronParseError),

    /// A `try_start` lock attempt found the lock already held.
    #[error("Lock busy: {key} is already running")]
    LockBusy {
        /// Store key of the contended lock.
        key: String,
    },

    /// A job token that cannot be split into name and id.
    #[error("Invalid job token: {0}")]
    InvalidToken(String),

    /// Invalid argument passed to an operation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Structured cron expression parse error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronParseError {
    /// The expression does not have exactly six whitespace separated fields.
    #[error("expected 6 fields, found {found}")]
    FieldCount {
        /// Number of fields found.
        found: usize,
    },

    /// A field contains text that is not a number, range or step.
    #[error("field {index} ({name}) is invalid: {field:?}")]
    InvalidField {
        /// One-based field position.
        index: usize,
        /// Field name (second, minute, ...).
        name: &'static str,
        /// The offending field text.
        field: String,
    },

    /// A field parsed but allows no value at all.
    #[error("field {index} ({name}) allows no value")]
    EmptyField {
        /// One-based field position.
        index: usize,
        /// Field name (second, minute, ...).
        name: &'static str,
    },
}

/// Result type alias using FleetError.
pub type Result<T> = std::result::Result<T, FleetError>;
