//! Reconnecting dropped remotes.
//!
//! Every connection gets one watcher task. When the connection drops on its
//! own, the watcher removes it from the pool, re-dials with exponential
//! backoff, and on success re-issues every repository's watches on that
//! endpoint and forces the current state of each overwrite ref sourced from
//! it. An explicit close or server shutdown stops the watcher instead, and
//! also stops a reconnect loop already under way for that endpoint.

use std::sync::Arc;

use refmesh_protocol::{RefIdentifier, RefUpdateUpstreamParams, RepoWatchParams};
use refmesh_sync::{retry_notify, ExponentialBackoff, RetryError, UpstreamClient};
use tokio_util::sync::CancellationToken;

use crate::error::ServerResult;
use crate::remotes::RemoteConnectionManager;

impl RemoteConnectionManager {
    pub(crate) fn spawn_watcher(
        self: &Arc<Self>,
        endpoint: String,
        id: u64,
        client: Arc<dyn UpstreamClient>,
        cancel: CancellationToken,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = client.disconnected() => {}
            }
            // Explicit close or shutdown raced the disconnect.
            if cancel.is_cancelled() {
                return;
            }
            drop(client);

            tracing::warn!(remote_client_monitor = %endpoint, "disconnected");
            let (generation, retry) = manager.begin_retry(&endpoint);
            manager.remove_if_current(&endpoint, id);
            manager.reconnect(&endpoint, &retry).await;
            manager.end_retry(&endpoint, generation);
        });
    }

    async fn reconnect(self: &Arc<Self>, endpoint: &str, retry: &CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.backoff.clone());
        let mut attempt = 0u32;
        let manager = self;
        let result = retry_notify(
            &mut backoff,
            retry,
            move || {
                attempt += 1;
                manager.try_reconnect(endpoint, attempt)
            },
            |err, delay| {
                tracing::debug!(
                    endpoint,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retry reconnect after error"
                );
            },
        )
        .await;

        match result {
            Ok(()) => {}
            Err(RetryError::Cancelled) => {
                tracing::debug!(endpoint, "reconnect abandoned after close or shutdown");
            }
            Err(RetryError::Exhausted(err)) => {
                tracing::error!(endpoint, error = %err, "reconnect failed after retries");
            }
        }
    }

    async fn try_reconnect(self: &Arc<Self>, endpoint: &str, attempt: u32) -> ServerResult<()> {
        tracing::debug!(endpoint, attempt, "try reconnect");
        let client = self.get_or_create_client(endpoint).await?;
        tracing::debug!(endpoint, attempt, "reconnect ok");
        self.reestablish(endpoint, client.as_ref()).await
    }

    /// Re-issue watches and force overwrite refs for every repository with a
    /// remote at `endpoint`. Each repository is handled under its own lock.
    pub(crate) async fn reestablish(
        &self,
        endpoint: &str,
        client: &dyn UpstreamClient,
    ) -> ServerResult<()> {
        for repo in self.repos.snapshot() {
            let state = repo.lock().await;
            for (remote_name, remote) in state.config.remotes_at(endpoint) {
                tracing::debug!(
                    endpoint,
                    reestablish_watch_repo = repo.name(),
                    remote = remote_name,
                    "re-establishing watch"
                );
                client
                    .repo_watch(RepoWatchParams {
                        repo: remote.repo.clone(),
                        refspec: remote.refspec.clone(),
                    })
                    .await?;

                for ref_name in state.config.overwrite_refs_of(remote_name) {
                    let Some(ref_state) = state.refdb.state(ref_name) else {
                        continue;
                    };
                    tracing::debug!(
                        endpoint,
                        repo = repo.name(),
                        ref_name,
                        history = ref_state.history.len(),
                        "forcing overwrite ref upstream"
                    );
                    client
                        .ref_update(RefUpdateUpstreamParams::forced(
                            RefIdentifier::new(remote.repo.clone(), ref_name),
                            ref_state.clone(),
                        ))
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, OnceLock, Weak};
    use std::time::Duration;

    use async_trait::async_trait;
    use refmesh_protocol::RefSpec;
    use refmesh_refs::{LogEntry, RefState};
    use refmesh_protocol::RefInfoResult;
    use refmesh_sync::{
        ConnectionFactory, InboundHandler, MemoryNetwork, MemoryUpstream, SyncError, SyncResult,
    };
    use serde_json::json;

    use super::*;
    use crate::repo::{RefConfig, RemoteConfig, RepoConfig};
    use crate::server::Server;
    use crate::test_support::wait_until;
    use crate::ServerConfig;

    fn remote(endpoint: &str, repo: &str) -> RemoteConfig {
        RemoteConfig {
            endpoint: endpoint.into(),
            repo: repo.into(),
            refspec: RefSpec::all(),
        }
    }

    fn tracked(upstream: &str, overwrite: bool) -> RefConfig {
        RefConfig { upstream: upstream.into(), overwrite }
    }

    fn main_state() -> RefState {
        let mut state = RefState::new("4f2a9c", "main");
        state.append("main", LogEntry::new(0, "alice", json!({"insert": "hello"}))).unwrap();
        state.append("main", LogEntry::new(1, "bob", json!({"delete": 3}))).unwrap();
        state
    }

    fn server(repos: Vec<(&str, RepoConfig)>, net: &Arc<MemoryNetwork>) -> Server {
        let config = ServerConfig {
            repos: repos.into_iter().map(|(n, c)| (n.to_string(), c)).collect(),
            ..Default::default()
        };
        let server = Server::new(config).unwrap();
        server.configure_remote_client_factory(net.clone());
        server
    }

    async fn seed(server: &Server, repo: &str, ref_name: &str, state: RefState) {
        let repo = server.repos().require(repo).unwrap();
        repo.lock().await.refdb.write(ref_name, state).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_on_third_attempt_restores_watch_and_forces_overwrite_ref() {
        let net = Arc::new(MemoryNetwork::new());
        let mut r1 = RepoConfig::default();
        r1.remotes.insert("peerA".into(), remote("peerA", "r1"));
        r1.refs.insert("main".into(), tracked("peerA", true));
        let server = server(vec![("r1", r1)], &net);
        let main = main_state();
        seed(&server, "r1", "main", main.clone()).await;

        server.watch_remote("r1", "peerA").await.unwrap();
        let first = net.latest("peerA").unwrap();
        assert_eq!(first.watches().len(), 1);

        net.fail_next("peerA", 2);
        first.disconnect();

        wait_until(|| net.connections("peerA").len() == 2).await;
        let second = net.latest("peerA").unwrap();
        wait_until(|| second.forced_updates().len() == 1).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        // One initial dial, two failures, one success.
        assert_eq!(net.dial_count("peerA"), 4);
        assert_eq!(
            second.watches(),
            vec![RepoWatchParams { repo: "r1".into(), refspec: RefSpec::all() }]
        );
        let updates = second.ref_updates();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].force);
        assert_eq!(updates[0].ref_id, RefIdentifier::new("r1", "main"));
        assert_eq!(updates[0].state.as_ref(), Some(&main));
        assert_eq!(first.watches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_repos_with_overwrite_refs_get_forced_updates() {
        let net = Arc::new(MemoryNetwork::new());
        let mut r1 = RepoConfig::default();
        r1.remotes.insert("b".into(), remote("peerB", "up-r1"));
        r1.remotes.insert("c".into(), remote("peerC", "up-r1"));
        r1.refs.insert("main".into(), tracked("b", true));
        r1.refs.insert("dev".into(), tracked("b", false));
        r1.refs.insert("missing".into(), tracked("b", true));
        r1.refs.insert("other".into(), tracked("c", true));
        let mut r2 = RepoConfig::default();
        r2.remotes.insert("b".into(), remote("peerB", "up-r2"));
        r2.refs.insert("main".into(), tracked("b", false));

        let server = server(vec![("r1", r1), ("r2", r2)], &net);
        for (repo, name) in [("r1", "main"), ("r1", "dev"), ("r1", "other"), ("r2", "main")] {
            seed(&server, repo, name, RefState::new("base", name)).await;
        }

        server.watch_remote("r1", "b").await.unwrap();
        server.watch_remote("r2", "b").await.unwrap();
        server.watch_remote("r1", "c").await.unwrap();
        net.latest("peerB").unwrap().disconnect();

        wait_until(|| net.connections("peerB").len() == 2).await;
        let second = net.latest("peerB").unwrap();
        wait_until(|| second.watches().len() == 2).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let watched: Vec<String> = second.watches().into_iter().map(|w| w.repo).collect();
        assert_eq!(watched, vec!["up-r1", "up-r2"]);
        let updates = second.ref_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].ref_id, RefIdentifier::new("up-r1", "main"));
        assert!(updates.iter().all(|u| u.ref_id.repo != "up-r2"));

        // peerC was never disconnected and sees nothing new.
        let peer_c = net.latest("peerC").unwrap();
        assert_eq!(net.connections("peerC").len(), 1);
        assert!(peer_c.ref_updates().is_empty());
    }

    /// Records, for each dial, whether the pool still had an entry.
    #[derive(Default)]
    struct ProbeFactory {
        net: MemoryNetwork,
        manager: OnceLock<Weak<RemoteConnectionManager>>,
        entry_present: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl ConnectionFactory for ProbeFactory {
        async fn connect(
            &self,
            cancel: &CancellationToken,
            endpoint: &str,
        ) -> SyncResult<Arc<dyn UpstreamClient>> {
            if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
                let present = manager.get_client(endpoint).is_some();
                self.entry_present.lock().unwrap().push(present);
            }
            self.net.connect(cancel, endpoint).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn entry_is_gone_before_first_reconnect_dial() {
        let probe = Arc::new(ProbeFactory::default());
        let server = Server::new(ServerConfig::default()).unwrap();
        server.configure_remote_client_factory(probe.clone());
        let _ = probe.manager.set(Arc::downgrade(server.remotes()));

        server.remotes().get_or_create_client("peerA").await.unwrap();
        probe.net.latest("peerA").unwrap().disconnect();
        wait_until(|| probe.net.connections("peerA").len() == 2).await;

        assert_eq!(*probe.entry_present.lock().unwrap(), vec![false, false]);
        assert!(server.remotes().get_client("peerA").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_after_budget() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        server.remotes().get_or_create_client("peerA").await.unwrap();

        net.fail_next("peerA", usize::MAX);
        net.latest("peerA").unwrap().disconnect();
        tokio::time::sleep(Duration::from_secs(300)).await;

        // Initial dial plus attempts at 0, 0.5, 1.5, 3.5, 7.5, 15.5, 31.5 and
        // 63.5 seconds; the last one is the first past the one-minute budget.
        assert_eq!(net.dial_count("peerA"), 9);
        assert!(server.remotes().get_client("peerA").is_none());

        // A later caller dials on demand.
        net.fail_next("peerA", 0);
        server.remotes().get_or_create_client("peerA").await.unwrap();
        assert_eq!(net.dial_count("peerA"), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_back_late_in_budget_is_reconnected() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        server.remotes().get_or_create_client("peerA").await.unwrap();

        net.fail_next("peerA", usize::MAX);
        net.latest("peerA").unwrap().disconnect();
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(server.remotes().get_client("peerA").is_none());

        net.fail_next("peerA", 0);
        tokio::time::sleep(Duration::from_secs(260)).await;
        assert_eq!(net.connections("peerA").len(), 2);
        assert!(server.remotes().get_client("peerA").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_initial_dial_is_not_retried() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        net.fail_next("peerA", 1);

        assert!(server.remotes().get_or_create_client("peerA").await.is_err());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(net.dial_count("peerA"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_does_not_reconnect() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        server.remotes().get_or_create_client("peerA").await.unwrap();

        server.remotes().close_and_remove_client("peerA").await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(net.dial_count("peerA"), 1);
        assert!(server.remotes().get_client("peerA").is_none());
    }

    /// Connections whose watch requests always fail.
    struct WatchRefused(Arc<MemoryUpstream>);

    #[async_trait]
    impl UpstreamClient for WatchRefused {
        async fn repo_watch(&self, _params: RepoWatchParams) -> SyncResult<()> {
            Err(SyncError::Transport("watch refused".into()))
        }

        async fn ref_info(&self, id: RefIdentifier) -> SyncResult<RefInfoResult> {
            self.0.ref_info(id).await
        }

        async fn ref_update(&self, params: RefUpdateUpstreamParams) -> SyncResult<()> {
            self.0.ref_update(params).await
        }

        fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
            self.0.set_inbound_handler(handler)
        }

        async fn disconnected(&self) {
            self.0.disconnected().await
        }

        async fn close(&self) -> SyncResult<()> {
            self.0.close().await
        }
    }

    #[derive(Default)]
    struct WatchRefusingNetwork(MemoryNetwork);

    #[async_trait]
    impl ConnectionFactory for WatchRefusingNetwork {
        async fn connect(
            &self,
            cancel: &CancellationToken,
            endpoint: &str,
        ) -> SyncResult<Arc<dyn UpstreamClient>> {
            self.0.connect(cancel, endpoint).await?;
            let inner = self.0.latest(endpoint).expect("connection just opened");
            Ok(Arc::new(WatchRefused(inner)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_stops_running_reconnect_loop() {
        let net = Arc::new(WatchRefusingNetwork::default());
        let mut r1 = RepoConfig::default();
        r1.remotes.insert("a".into(), remote("peerA", "r1"));
        let config = ServerConfig {
            repos: [("r1".to_string(), r1)].into_iter().collect(),
            ..Default::default()
        };
        let server = Server::new(config).unwrap();
        server.configure_remote_client_factory(net.clone());
        server.remotes().get_or_create_client("peerA").await.unwrap();

        // The first reconnect dial succeeds but re-establishing the watch
        // fails, so the loop is sleeping before its next attempt.
        net.0.latest("peerA").unwrap().disconnect();
        wait_until(|| net.0.dial_count("peerA") == 2).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.remotes().get_client("peerA").is_some());

        server.remotes().close_and_remove_client("peerA").await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(net.0.dial_count("peerA"), 2);
        assert!(server.remotes().get_client("peerA").is_none());
        assert!(net.0.latest("peerA").unwrap().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_prevents_reconnect() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        server.remotes().get_or_create_client("peerA").await.unwrap();
        let conn = net.latest("peerA").unwrap();

        server.shutdown().await;
        conn.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(conn.is_disconnected());
        assert_eq!(net.dial_count("peerA"), 1);
        assert!(server.remotes().connected_endpoints().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_retry_loop() {
        let net = Arc::new(MemoryNetwork::new());
        let server = server(vec![], &net);
        server.remotes().get_or_create_client("peerA").await.unwrap();

        net.fail_next("peerA", usize::MAX);
        net.latest("peerA").unwrap().disconnect();
        wait_until(|| net.dial_count("peerA") == 3).await;
        server.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(net.dial_count("peerA"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn every_reconnect_reestablishes() {
        let net = Arc::new(MemoryNetwork::new());
        let mut r1 = RepoConfig::default();
        r1.remotes.insert("a".into(), remote("peerA", "r1"));
        r1.refs.insert("main".into(), tracked("a", true));
        let server = server(vec![("r1", r1)], &net);
        seed(&server, "r1", "main", main_state()).await;
        server.watch_remote("r1", "a").await.unwrap();

        net.latest("peerA").unwrap().disconnect();
        wait_until(|| net.connections("peerA").len() == 2).await;
        let second = net.latest("peerA").unwrap();
        wait_until(|| second.forced_updates().len() == 1).await;

        // The replacement drops too; its own watcher takes over.
        second.disconnect();
        wait_until(|| {
            net.connections("peerA").len() == 3
                && net.latest("peerA").is_some_and(|c| c.forced_updates().len() == 1)
        })
        .await;
        assert_eq!(server.remotes().connected_endpoints(), vec!["peerA"]);
        assert_eq!(second.forced_updates().len(), 1);
    }
}
