//! Server core for refmesh.
//!
//! Hosts repositories, keeps at most one connection per upstream endpoint,
//! applies ref updates those upstreams push, and after a dropped connection
//! re-dials with backoff and restores watches and overwrite refs.

pub mod config;
pub mod error;
pub mod handler;
mod inbound;
pub mod logging;
pub mod registry;
pub mod remotes;
pub mod repo;
pub mod server;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::{ApplyUpstreamUpdates, RefUpdateHandler};
pub use registry::RepoRegistry;
pub use remotes::RemoteConnectionManager;
pub use repo::{RefConfig, RemoteConfig, RepoConfig, RepoState, Repository};
pub use server::Server;
