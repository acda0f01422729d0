//! The pool of connections to remote endpoints.
//!
//! At most one connection per endpoint exists at any instant. Creation is
//! serialized by a single dial lock held across the dial, so dials to
//! different endpoints also wait for each other. The endpoint map itself sits
//! behind a separate short lock: lookups, removals on disconnect, and explicit
//! closes never wait for a dial in progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use refmesh_sync::{BackoffConfig, ConnectionFactory, SyncError, UpstreamClient};
use tokio_util::sync::CancellationToken;

use crate::error::ServerResult;
use crate::handler::RefUpdateHandler;
use crate::inbound::InboundDispatch;
use crate::registry::RepoRegistry;

struct RemoteConnection {
    id: u64,
    client: Arc<dyn UpstreamClient>,
    /// Stops this connection's disconnect watcher.
    cancel: CancellationToken,
}

pub struct RemoteConnectionManager {
    conns: Mutex<HashMap<String, RemoteConnection>>,
    /// Reconnect loop currently running per endpoint, tagged with a generation.
    retries: Mutex<HashMap<String, (u64, CancellationToken)>>,
    dial: tokio::sync::Mutex<()>,
    factory: OnceLock<Arc<dyn ConnectionFactory>>,
    next_id: AtomicU64,
    pub(crate) repos: Arc<RepoRegistry>,
    handler: Arc<dyn RefUpdateHandler>,
    pub(crate) backoff: BackoffConfig,
    pub(crate) shutdown: CancellationToken,
}

impl RemoteConnectionManager {
    pub fn new(
        repos: Arc<RepoRegistry>,
        handler: Arc<dyn RefUpdateHandler>,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            retries: Mutex::new(HashMap::new()),
            dial: tokio::sync::Mutex::new(()),
            factory: OnceLock::new(),
            next_id: AtomicU64::new(1),
            repos,
            handler,
            backoff,
            shutdown,
        }
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<String, RemoteConnection>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retries(&self) -> MutexGuard<'_, HashMap<String, (u64, CancellationToken)>> {
        self.retries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the factory used to dial remotes.
    ///
    /// # Panics
    ///
    /// If a factory was already configured.
    pub fn configure_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        if self.factory.set(factory).is_err() {
            panic!("remote client factory is already configured");
        }
    }

    /// The live connection to `endpoint`, if any. Never dials.
    pub fn get_client(&self, endpoint: &str) -> Option<Arc<dyn UpstreamClient>> {
        self.conns().get(endpoint).map(|c| Arc::clone(&c.client))
    }

    /// Return the live connection to `endpoint`, dialing it if there is none.
    ///
    /// A new connection gets the inbound handler installed and a disconnect
    /// watcher started before it becomes visible to other callers. Dial errors
    /// are returned as is; they do not schedule a retry.
    ///
    /// # Panics
    ///
    /// If no factory was configured.
    pub async fn get_or_create_client(
        self: &Arc<Self>,
        endpoint: &str,
    ) -> ServerResult<Arc<dyn UpstreamClient>> {
        if let Some(client) = self.get_client(endpoint) {
            return Ok(client);
        }

        let _dial = self.dial.lock().await;
        let Some(factory) = self.factory.get() else {
            panic!("remote client factory must be configured before dialing {endpoint}");
        };
        if let Some(client) = self.get_client(endpoint) {
            return Ok(client);
        }
        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled.into());
        }

        let client = factory.connect(&self.shutdown, endpoint).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        client.set_inbound_handler(Arc::new(InboundDispatch::new(
            endpoint,
            Arc::clone(&self.handler),
            cancel.clone(),
        )));
        // Checked under the map lock so `close_all` after a shutdown either
        // drains this entry or it is never inserted.
        let admitted = {
            let mut conns = self.conns();
            let open = !self.shutdown.is_cancelled();
            if open {
                conns.insert(
                    endpoint.to_string(),
                    RemoteConnection {
                        id,
                        client: Arc::clone(&client),
                        cancel: cancel.clone(),
                    },
                );
            }
            open
        };
        if !admitted {
            tracing::debug!(endpoint, "shut down while dialing; dropping new connection");
            if let Err(err) = client.close().await {
                tracing::warn!(endpoint, error = %err, "error closing remote client");
            }
            return Err(SyncError::Cancelled.into());
        }
        tracing::info!(endpoint, "connected to remote");
        self.spawn_watcher(endpoint.to_string(), id, Arc::clone(&client), cancel);
        Ok(client)
    }

    /// Remove and close the connection to `endpoint`. No reconnect follows,
    /// and a reconnect loop already running for `endpoint` is stopped.
    ///
    /// # Panics
    ///
    /// If there is no connection to `endpoint`.
    pub async fn close_and_remove_client(&self, endpoint: &str) -> ServerResult<()> {
        let Some(conn) = self.conns().remove(endpoint) else {
            panic!("no remote client for endpoint {endpoint}");
        };
        tracing::debug!(endpoint, "closing remote client");
        conn.cancel.cancel();
        let retry = self.retries().remove(endpoint);
        if let Some((_, retry)) = retry {
            retry.cancel();
        }
        conn.client.close().await?;
        Ok(())
    }

    /// Close every connection without reconnecting.
    pub async fn close_all(&self) {
        let retries: Vec<(u64, CancellationToken)> = self.retries().drain().map(|(_, r)| r).collect();
        for (_, retry) in retries {
            retry.cancel();
        }
        let drained: Vec<(String, RemoteConnection)> = self.conns().drain().collect();
        for (endpoint, conn) in drained {
            conn.cancel.cancel();
            if let Err(err) = conn.client.close().await {
                tracing::warn!(endpoint, error = %err, "error closing remote client");
            }
        }
    }

    /// Endpoints with a live connection, sorted.
    pub fn connected_endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.conns().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Register a reconnect loop for `endpoint`, stopping any earlier one.
    /// The returned token fires on shutdown or on an explicit close.
    pub(crate) fn begin_retry(&self, endpoint: &str) -> (u64, CancellationToken) {
        let generation = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        let previous = self
            .retries()
            .insert(endpoint.to_string(), (generation, token.clone()));
        if let Some((_, previous)) = previous {
            previous.cancel();
        }
        (generation, token)
    }

    /// Forget the reconnect loop `generation` for `endpoint` if still registered.
    pub(crate) fn end_retry(&self, endpoint: &str, generation: u64) {
        let mut retries = self.retries();
        if retries.get(endpoint).is_some_and(|(g, _)| *g == generation) {
            retries.remove(endpoint);
        }
    }

    /// Drop the entry for `endpoint` if it still belongs to connection `id`.
    pub(crate) fn remove_if_current(&self, endpoint: &str, id: u64) -> bool {
        let mut conns = self.conns();
        match conns.get(endpoint) {
            Some(conn) if conn.id == id => {
                conns.remove(endpoint);
                true
            }
            _ => false,
        }
    }
}
