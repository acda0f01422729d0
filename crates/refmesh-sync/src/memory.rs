//! In-memory upstream connections.
//!
//! [`MemoryUpstream`] implements [`UpstreamClient`] without a network: it
//! records every call, keeps the peer's view of refs in a `BTreeMap`, and lets
//! the owner simulate pushes and disconnects. [`MemoryNetwork`] is a
//! [`ConnectionFactory`] handing out such connections, with scriptable dial
//! failures and latency.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use refmesh_protocol::{
    RefIdentifier, RefInfoResult, RefUpdateDownstreamParams, RefUpdateSymbolicParams,
    RefUpdateUpstreamParams, RepoWatchParams,
};
use refmesh_refs::RefState;
use tokio_util::sync::CancellationToken;

use crate::error::{SyncError, SyncResult};
use crate::transport::{ConnectionFactory, InboundHandler, UpstreamClient};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct PeerState {
    watches: Vec<RepoWatchParams>,
    updates: Vec<RefUpdateUpstreamParams>,
    refs: BTreeMap<RefIdentifier, RefState>,
}

/// A connection to a simulated peer.
pub struct MemoryUpstream {
    endpoint: String,
    peer: Mutex<PeerState>,
    handler: Mutex<Option<Arc<dyn InboundHandler>>>,
    handler_installs: AtomicUsize,
    gone: CancellationToken,
}

impl MemoryUpstream {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            peer: Mutex::new(PeerState::default()),
            handler: Mutex::new(None),
            handler_installs: AtomicUsize::new(0),
            gone: CancellationToken::new(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Every watch request received, in order.
    pub fn watches(&self) -> Vec<RepoWatchParams> {
        lock(&self.peer).watches.clone()
    }

    /// Every ref update received, in order.
    pub fn ref_updates(&self) -> Vec<RefUpdateUpstreamParams> {
        lock(&self.peer).updates.clone()
    }

    pub fn forced_updates(&self) -> Vec<RefUpdateUpstreamParams> {
        lock(&self.peer).updates.iter().filter(|u| u.force).cloned().collect()
    }

    /// Seed the peer's copy of a ref, as seen by `ref_info`.
    pub fn set_peer_ref(&self, id: RefIdentifier, state: RefState) {
        lock(&self.peer).refs.insert(id, state);
    }

    pub fn peer_ref(&self, id: &RefIdentifier) -> Option<RefState> {
        lock(&self.peer).refs.get(id).cloned()
    }

    /// How many times an inbound handler was installed on this connection.
    pub fn handler_installs(&self) -> usize {
        self.handler_installs.load(Ordering::SeqCst)
    }

    pub fn is_disconnected(&self) -> bool {
        self.gone.is_cancelled()
    }

    /// Drop the connection from the peer's side.
    pub fn disconnect(&self) {
        tracing::debug!(endpoint = %self.endpoint, "simulated disconnect");
        self.gone.cancel();
    }

    /// Deliver a ref update from the peer to the installed handler.
    pub async fn push_ref_update(&self, params: RefUpdateDownstreamParams) -> SyncResult<()> {
        self.inbound()?.ref_update(params).await
    }

    /// Deliver a symbolic ref update from the peer to the installed handler.
    pub async fn push_ref_update_symbolic(&self, params: RefUpdateSymbolicParams) -> SyncResult<()> {
        self.inbound()?.ref_update_symbolic(params).await
    }

    fn inbound(&self) -> SyncResult<Arc<dyn InboundHandler>> {
        self.ensure_open()?;
        lock(&self.handler)
            .clone()
            .ok_or_else(|| SyncError::Transport(format!("{}: no inbound handler", self.endpoint)))
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.gone.is_cancelled() {
            return Err(SyncError::Closed(self.endpoint.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    async fn repo_watch(&self, params: RepoWatchParams) -> SyncResult<()> {
        self.ensure_open()?;
        lock(&self.peer).watches.push(params);
        Ok(())
    }

    async fn ref_info(&self, id: RefIdentifier) -> SyncResult<RefInfoResult> {
        self.ensure_open()?;
        let state = lock(&self.peer).refs.get(&id).cloned();
        Ok(RefInfoResult { state, target: None })
    }

    async fn ref_update(&self, params: RefUpdateUpstreamParams) -> SyncResult<()> {
        self.ensure_open()?;
        params.validate()?;
        let mut peer = lock(&self.peer);
        match &params.state {
            Some(state) => {
                peer.refs.insert(params.ref_id.clone(), state.clone());
            }
            None => {
                peer.refs.remove(&params.ref_id);
            }
        }
        peer.updates.push(params);
        Ok(())
    }

    fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        self.handler_installs.fetch_add(1, Ordering::SeqCst);
        *lock(&self.handler) = Some(handler);
    }

    async fn disconnected(&self) {
        self.gone.cancelled().await
    }

    async fn close(&self) -> SyncResult<()> {
        self.gone.cancel();
        Ok(())
    }
}

#[derive(Default)]
struct NetworkState {
    dials: HashMap<String, usize>,
    failures: HashMap<String, usize>,
    connections: HashMap<String, Vec<Arc<MemoryUpstream>>>,
}

/// A [`ConnectionFactory`] that dials [`MemoryUpstream`] peers.
#[derive(Default)]
pub struct MemoryNetwork {
    state: Mutex<NetworkState>,
    latency: Mutex<Duration>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every dial take `latency` before completing.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = latency;
    }

    /// Fail the next `n` dials to `endpoint`.
    pub fn fail_next(&self, endpoint: &str, n: usize) {
        lock(&self.state).failures.insert(endpoint.to_string(), n);
    }

    /// Number of dials attempted to `endpoint`, failed ones included.
    pub fn dial_count(&self, endpoint: &str) -> usize {
        lock(&self.state).dials.get(endpoint).copied().unwrap_or(0)
    }

    /// Every connection successfully opened to `endpoint`, oldest first.
    pub fn connections(&self, endpoint: &str) -> Vec<Arc<MemoryUpstream>> {
        lock(&self.state).connections.get(endpoint).cloned().unwrap_or_default()
    }

    pub fn latest(&self, endpoint: &str) -> Option<Arc<MemoryUpstream>> {
        lock(&self.state).connections.get(endpoint).and_then(|c| c.last().cloned())
    }
}

#[async_trait]
impl ConnectionFactory for MemoryNetwork {
    async fn connect(
        &self,
        cancel: &CancellationToken,
        endpoint: &str,
    ) -> SyncResult<Arc<dyn UpstreamClient>> {
        let latency = *lock(&self.latency);
        tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep(latency) => {}
        }

        let mut state = lock(&self.state);
        *state.dials.entry(endpoint.to_string()).or_default() += 1;
        if let Some(left) = state.failures.get_mut(endpoint) {
            if *left > 0 {
                *left -= 1;
                return Err(SyncError::Transport(format!("dial {endpoint}: connection refused")));
            }
        }
        let conn = Arc::new(MemoryUpstream::new(endpoint));
        state
            .connections
            .entry(endpoint.to_string())
            .or_default()
            .push(Arc::clone(&conn));
        Ok(conn)
    }
}
