//! Ref model for refmesh.
//!
//! A ref is a named, mutable pointer into a revision history. Its value is a
//! [`RefState`]: the base revision and branch it was created from, plus the
//! ordered history of log entries applied on top of that base.
//!
//! # Architecture
//!
//! - **Direct refs** carry a [`RefState`] and may be replicated to or from a
//!   remote endpoint.
//! - **Symbolic refs** (e.g. `HEAD`) name another ref. They are local-only and
//!   are never replicated between servers.
//!
//! # Modules
//!
//! - [`error`]: Error types for ref operations
//! - [`types`]: Core ref types: [`Ref`], [`RefState`], [`RefBaseInfo`], [`LogEntry`]
//! - [`names`]: Ref and remote name validation
//! - [`refdb`]: The per-repository [`RefDb`]

pub mod error;
pub mod names;
pub mod refdb;
pub mod types;

pub use error::{RefError, Result};
pub use names::{validate_ref_name, validate_remote_name};
pub use refdb::RefDb;
pub use types::{LogEntry, Ref, RefBaseInfo, RefState};
