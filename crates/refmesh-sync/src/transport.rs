use std::sync::Arc;

use async_trait::async_trait;
use refmesh_protocol::{
    RefIdentifier, RefInfoResult, RefUpdateDownstreamParams, RefUpdateSymbolicParams,
    RefUpdateUpstreamParams, RepoWatchParams,
};
use tokio_util::sync::CancellationToken;

use crate::error::SyncResult;

/// A live connection to one upstream peer server.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Subscribe to ref changes. Re-watching the same repo/refspec is not an error.
    async fn repo_watch(&self, params: RepoWatchParams) -> SyncResult<()>;
    async fn ref_info(&self, id: RefIdentifier) -> SyncResult<RefInfoResult>;
    async fn ref_update(&self, params: RefUpdateUpstreamParams) -> SyncResult<()>;

    /// Install the handler for updates the peer pushes to us. Replaces any
    /// previously installed handler.
    fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>);

    /// Resolves once the connection is gone, including after [`close`](Self::close).
    async fn disconnected(&self);

    async fn close(&self) -> SyncResult<()>;
}

/// Receives updates pushed by a peer over one connection.
///
/// An error is returned to the peer as a rejection of the push.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn ref_update(&self, params: RefUpdateDownstreamParams) -> SyncResult<()>;
    async fn ref_update_symbolic(&self, params: RefUpdateSymbolicParams) -> SyncResult<()>;
}

/// Dials upstream peers.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection to `endpoint`. Must give up when `cancel` fires.
    async fn connect(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
    ) -> SyncResult<Arc<dyn UpstreamClient>>;
}
