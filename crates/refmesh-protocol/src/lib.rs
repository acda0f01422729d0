//! Wire parameter types for refmesh.
//!
//! Defines the request and notification payloads exchanged between peer
//! servers when they watch each other's repositories and replicate refs. The
//! transport that carries them is supplied by the embedding application.

pub mod error;
pub mod message;
pub mod refspec;

pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    methods, RefIdentifier, RefInfoResult, RefUpdateDownstreamParams, RefUpdateSymbolicParams,
    RefUpdateUpstreamParams, RepoWatchParams, PROTOCOL_VERSION,
};
pub use refspec::RefSpec;
