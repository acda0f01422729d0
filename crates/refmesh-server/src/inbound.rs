//! Per-connection dispatch of updates pushed by a peer.

use std::sync::Arc;

use async_trait::async_trait;
use refmesh_protocol::{RefUpdateDownstreamParams, RefUpdateSymbolicParams};
use refmesh_sync::{InboundHandler, SyncError, SyncResult};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::handler::RefUpdateHandler;

/// Installed on every connection when it is created. Invocations on one
/// connection run one at a time.
pub(crate) struct InboundDispatch {
    endpoint: String,
    handler: Arc<dyn RefUpdateHandler>,
    cancel: CancellationToken,
    turn: Mutex<()>,
}

impl InboundDispatch {
    pub(crate) fn new(
        endpoint: impl Into<String>,
        handler: Arc<dyn RefUpdateHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            handler,
            cancel,
            turn: Mutex::new(()),
        }
    }
}

#[async_trait]
impl InboundHandler for InboundDispatch {
    async fn ref_update(&self, params: RefUpdateDownstreamParams) -> SyncResult<()> {
        let _turn = self.turn.lock().await;
        if let Err(err) = self
            .handler
            .handle_ref_update_from_upstream(&self.cancel, &params, &self.endpoint)
            .await
        {
            tracing::error!(
                callback_from_remote_endpoint = %self.endpoint,
                ref_id = %params.ref_id,
                error = %err,
                "ref update from remote rejected"
            );
            return Err(SyncError::Rejected(err.to_string()));
        }
        Ok(())
    }

    async fn ref_update_symbolic(&self, params: RefUpdateSymbolicParams) -> SyncResult<()> {
        // Symbolic refs are local to each server and never replicated.
        let _turn = self.turn.lock().await;
        tracing::trace!(endpoint = %self.endpoint, ref_id = %params.ref_id, "ignoring symbolic ref update");
        Ok(())
    }
}
