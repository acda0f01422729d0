//! Upstream connections for refmesh.
//!
//! Describes what a server needs from a connection to one peer: watching a
//! remote repository, reading and updating remote refs, receiving pushed ref
//! updates, and learning when the connection drops. Also provides the
//! exponential backoff used when re-dialing a dropped peer, and an in-memory
//! implementation of the whole capability for tests and embedding.

pub mod backoff;
pub mod error;
pub mod memory;
pub mod transport;

pub use backoff::{retry_notify, BackoffConfig, Clock, ExponentialBackoff, RetryError, TokioClock};
pub use error::{SyncError, SyncResult};
pub use memory::{MemoryNetwork, MemoryUpstream};
pub use transport::{ConnectionFactory, InboundHandler, UpstreamClient};
