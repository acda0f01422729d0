//! Error types for reference operations.

use thiserror::Error;

/// Errors that can occur during reference operations.
#[derive(Debug, Error)]
pub enum RefError {
    /// The reference was not found.
    #[error("ref not found: {name}")]
    NotFound { name: String },

    /// The ref or remote name is invalid.
    #[error("invalid name: {name}: {reason}")]
    InvalidName { name: String, reason: String },

    /// A symbolic ref points at a ref that does not exist.
    #[error("dangling symbolic ref: {name} -> {target}")]
    DanglingSymbolic { name: String, target: String },

    /// A name is already in use by a ref of the other kind.
    #[error("ref {name} is already a {existing} ref")]
    KindConflict { name: String, existing: &'static str },

    /// An appended log entry does not continue the ref's history.
    #[error("history gap on {name}: expected seq {expected}, got {actual}")]
    HistoryGap {
        name: String,
        expected: u64,
        actual: u64,
    },
}

/// Convenience type alias for ref operations.
pub type Result<T> = std::result::Result<T, RefError>;
