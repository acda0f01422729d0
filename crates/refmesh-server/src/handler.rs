//! Applying ref updates pushed by upstream peers.

use std::sync::Arc;

use async_trait::async_trait;
use refmesh_protocol::RefUpdateDownstreamParams;
use refmesh_sync::SyncError;
use tokio_util::sync::CancellationToken;

use crate::error::{ServerError, ServerResult};
use crate::registry::RepoRegistry;

/// Handles a ref update pushed to this server by the peer at `endpoint`.
///
/// An error rejects the push: it is logged and returned to the peer.
#[async_trait]
pub trait RefUpdateHandler: Send + Sync {
    async fn handle_ref_update_from_upstream(
        &self,
        cancel: &CancellationToken,
        params: &RefUpdateDownstreamParams,
        endpoint: &str,
    ) -> ServerResult<()>;
}

/// Writes pushed state into every local repository tracking the ref.
///
/// A local ref tracks `{endpoint, repo, ref}` when its repository has a remote
/// at `endpoint` for that remote repo whose refspec matches the ref, and the
/// ref's configured upstream is that remote.
pub struct ApplyUpstreamUpdates {
    repos: Arc<RepoRegistry>,
}

impl ApplyUpstreamUpdates {
    pub fn new(repos: Arc<RepoRegistry>) -> Self {
        Self { repos }
    }
}

#[async_trait]
impl RefUpdateHandler for ApplyUpstreamUpdates {
    async fn handle_ref_update_from_upstream(
        &self,
        cancel: &CancellationToken,
        params: &RefUpdateDownstreamParams,
        endpoint: &str,
    ) -> ServerResult<()> {
        let ref_name = params.ref_id.ref_name.as_str();
        let mut applied = 0usize;

        for repo in self.repos.snapshot() {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }
            let mut guard = repo.lock().await;
            let state = &mut *guard;

            let tracked = state.config.upstream_of(ref_name).is_some_and(|(_, remote)| {
                remote.endpoint == endpoint
                    && remote.repo == params.ref_id.repo
                    && remote.refspec.matches(ref_name)
            });
            if !tracked {
                continue;
            }

            match &params.state {
                Some(new_state) => state.refdb.write(ref_name, new_state.clone())?,
                None => {
                    state.refdb.delete(ref_name);
                }
            }
            tracing::debug!(
                endpoint,
                repo = repo.name(),
                ref_name,
                deleted = params.state.is_none(),
                "applied ref update from upstream"
            );
            applied += 1;
        }

        if applied == 0 {
            return Err(ServerError::NotTracked {
                endpoint: endpoint.to_string(),
                ref_id: params.ref_id.clone(),
            });
        }
        Ok(())
    }
}
