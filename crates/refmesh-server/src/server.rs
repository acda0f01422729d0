use std::sync::Arc;

use refmesh_protocol::{RefIdentifier, RefInfoResult, RefUpdateUpstreamParams, RepoWatchParams};
use refmesh_refs::RefState;
use refmesh_sync::ConnectionFactory;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{ApplyUpstreamUpdates, RefUpdateHandler};
use crate::registry::RepoRegistry;
use crate::remotes::RemoteConnectionManager;
use crate::repo::RemoteConfig;

/// A refmesh server: hosted repositories plus the connections to their upstreams.
pub struct Server {
    config: ServerConfig,
    repos: Arc<RepoRegistry>,
    remotes: Arc<RemoteConnectionManager>,
    shutdown: CancellationToken,
}

impl Server {
    /// Build a server that applies upstream pushes with [`ApplyUpstreamUpdates`].
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        let repos = Arc::new(RepoRegistry::new());
        let handler = Arc::new(ApplyUpstreamUpdates::new(Arc::clone(&repos)));
        Self::build(config, repos, handler)
    }

    pub fn with_handler(
        config: ServerConfig,
        handler: Arc<dyn RefUpdateHandler>,
    ) -> ServerResult<Self> {
        Self::build(config, Arc::new(RepoRegistry::new()), handler)
    }

    fn build(
        config: ServerConfig,
        repos: Arc<RepoRegistry>,
        handler: Arc<dyn RefUpdateHandler>,
    ) -> ServerResult<Self> {
        config.backoff.validate()?;
        for (name, repo_config) in &config.repos {
            repos.create(name, repo_config.clone())?;
        }
        let shutdown = CancellationToken::new();
        let remotes = Arc::new(RemoteConnectionManager::new(
            Arc::clone(&repos),
            handler,
            config.backoff.clone(),
            shutdown.clone(),
        ));
        tracing::info!(repos = repos.len(), "server initialized");
        Ok(Self { config, repos, remotes, shutdown })
    }

    /// Set how remotes are dialed. Must be called exactly once, before any
    /// operation that reaches a remote.
    pub fn configure_remote_client_factory(&self, factory: Arc<dyn ConnectionFactory>) {
        self.remotes.configure_factory(factory);
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn repos(&self) -> &Arc<RepoRegistry> {
        &self.repos
    }

    pub fn remotes(&self) -> &Arc<RemoteConnectionManager> {
        &self.remotes
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn remote_config(&self, repo: &str, remote: &str) -> ServerResult<RemoteConfig> {
        let repository = self.repos.require(repo)?;
        let state = repository.lock().await;
        state
            .config
            .remotes
            .get(remote)
            .cloned()
            .ok_or_else(|| ServerError::RemoteNotFound {
                repo: repo.to_string(),
                remote: remote.to_string(),
            })
    }

    /// Subscribe to ref changes of `remote` as configured on `repo`.
    pub async fn watch_remote(&self, repo: &str, remote: &str) -> ServerResult<()> {
        let config = self.remote_config(repo, remote).await?;
        let client = self.remotes.get_or_create_client(&config.endpoint).await?;
        client
            .repo_watch(RepoWatchParams {
                repo: config.repo.clone(),
                refspec: config.refspec.clone(),
            })
            .await?;
        tracing::debug!(endpoint = %config.endpoint, repo, remote, "watching remote");
        Ok(())
    }

    /// Ask `remote` for its copy of `ref_name`.
    pub async fn remote_ref_info(
        &self,
        repo: &str,
        remote: &str,
        ref_name: &str,
    ) -> ServerResult<RefInfoResult> {
        let config = self.remote_config(repo, remote).await?;
        let client = self.remotes.get_or_create_client(&config.endpoint).await?;
        Ok(client.ref_info(RefIdentifier::new(config.repo, ref_name)).await?)
    }

    /// Write `ref_name` locally and, if it tracks an upstream, push the new
    /// state there. The repository stays locked until the push completes.
    pub async fn update_ref(&self, repo: &str, ref_name: &str, state: RefState) -> ServerResult<()> {
        let repository = self.repos.require(repo)?;
        let mut guard = repository.lock().await;
        guard.refdb.write(ref_name, state.clone())?;

        let Some((remote_name, remote)) = guard.config.upstream_of(ref_name) else {
            return Ok(());
        };
        let remote_name = remote_name.to_string();
        let remote = remote.clone();

        let client = self.remotes.get_or_create_client(&remote.endpoint).await?;
        client
            .ref_update(RefUpdateUpstreamParams {
                ref_id: RefIdentifier::new(remote.repo, ref_name),
                force: false,
                state: Some(state),
            })
            .await?;
        tracing::debug!(
            endpoint = %remote.endpoint,
            repo,
            remote = %remote_name,
            ref_name,
            "pushed ref upstream"
        );
        Ok(())
    }

    /// Point `name` at `target`. Symbolic refs stay local.
    pub async fn set_symbolic_ref(&self, repo: &str, name: &str, target: &str) -> ServerResult<()> {
        let repository = self.repos.require(repo)?;
        repository.lock().await.refdb.set_symbolic(name, target)?;
        Ok(())
    }

    /// Stop every watcher, retry loop and dial, then close all connections.
    pub async fn shutdown(&self) {
        tracing::info!("server shutting down");
        self.shutdown.cancel();
        self.remotes.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{RefConfig, RepoConfig};
    use refmesh_protocol::{RefSpec, RefUpdateDownstreamParams, RefUpdateSymbolicParams};
    use refmesh_sync::{MemoryNetwork, SyncError};

    fn config() -> ServerConfig {
        let mut r1 = RepoConfig::default();
        r1.remotes.insert(
            "origin".into(),
            RemoteConfig {
                endpoint: "peerA".into(),
                repo: "up".into(),
                refspec: RefSpec::all(),
            },
        );
        r1.refs.insert("main".into(), RefConfig { upstream: "origin".into(), overwrite: false });
        let mut config = ServerConfig::default();
        config.repos.insert("r1".into(), r1);
        config.repos.insert("r2".into(), RepoConfig::default());
        config
    }

    fn started() -> (Server, Arc<MemoryNetwork>) {
        let net = Arc::new(MemoryNetwork::new());
        let server = Server::new(config()).unwrap();
        server.configure_remote_client_factory(net.clone());
        (server, net)
    }

    #[test]
    fn repos_come_from_config() {
        let server = Server::new(config()).unwrap();
        assert_eq!(server.repos().names(), vec!["r1", "r2"]);
        assert_eq!(server.config().backoff.initial_interval_ms, 500);
        assert!(!server.is_shutting_down());
    }

    #[test]
    fn invalid_repo_config_is_rejected() {
        let mut config = ServerConfig::default();
        let mut bad = RepoConfig::default();
        bad.refs.insert("main".into(), RefConfig { upstream: "nowhere".into(), overwrite: false });
        config.repos.insert("r1".into(), bad);
        assert!(matches!(Server::new(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let mut config = config();
        config.backoff.multiplier = 1e20;
        assert!(matches!(
            Server::new(config),
            Err(ServerError::Sync(SyncError::InvalidBackoff(_)))
        ));
    }

    #[tokio::test]
    async fn watch_remote_issues_watch() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();

        let conn = net.latest("peerA").unwrap();
        assert_eq!(
            conn.watches(),
            vec![RepoWatchParams { repo: "up".into(), refspec: RefSpec::all() }]
        );
        assert_eq!(conn.handler_installs(), 1);
    }

    #[tokio::test]
    async fn watch_unknown_remote_or_repo() {
        let (server, net) = started();
        assert!(matches!(
            server.watch_remote("r1", "nope").await,
            Err(ServerError::RemoteNotFound { .. })
        ));
        assert!(matches!(
            server.watch_remote("zz", "origin").await,
            Err(ServerError::RepoNotFound(_))
        ));
        assert_eq!(net.dial_count("peerA"), 0);
    }

    #[tokio::test]
    async fn inbound_push_updates_tracked_ref() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();
        let conn = net.latest("peerA").unwrap();

        conn.push_ref_update(RefUpdateDownstreamParams {
            ref_id: RefIdentifier::new("up", "main"),
            state: Some(RefState::new("c0ffee", "main")),
        })
        .await
        .unwrap();

        let repo = server.repos().require("r1").unwrap();
        let state = repo.lock().await;
        assert_eq!(state.refdb.state("main").unwrap().base.git_base, "c0ffee");
    }

    #[tokio::test]
    async fn untracked_push_is_rejected() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();
        let conn = net.latest("peerA").unwrap();

        let err = conn
            .push_ref_update(RefUpdateDownstreamParams {
                ref_id: RefIdentifier::new("up", "feature"),
                state: Some(RefState::new("c0ffee", "feature")),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected(_)));
        assert!(server.repos().require("r1").unwrap().lock().await.refdb.is_empty());
    }

    #[tokio::test]
    async fn symbolic_push_changes_nothing() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();
        net.latest("peerA")
            .unwrap()
            .push_ref_update_symbolic(RefUpdateSymbolicParams {
                ref_id: RefIdentifier::new("up", "HEAD"),
                target: "main".into(),
                old_target: None,
            })
            .await
            .unwrap();
        assert!(server.repos().require("r1").unwrap().lock().await.refdb.is_empty());
    }

    #[tokio::test]
    async fn update_ref_pushes_tracked_refs_only() {
        let (server, net) = started();
        server.update_ref("r1", "main", RefState::new("v1", "main")).await.unwrap();
        server.update_ref("r1", "scratch", RefState::new("v1", "scratch")).await.unwrap();

        let conn = net.latest("peerA").unwrap();
        let updates = conn.ref_updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].force);
        assert_eq!(updates[0].ref_id, RefIdentifier::new("up", "main"));
        assert!(conn.peer_ref(&RefIdentifier::new("up", "main")).is_some());

        let repo = server.repos().require("r1").unwrap();
        assert!(repo.lock().await.refdb.state("scratch").is_some());
    }

    #[tokio::test]
    async fn remote_ref_info_reads_peer() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();
        net.latest("peerA")
            .unwrap()
            .set_peer_ref(RefIdentifier::new("up", "main"), RefState::new("abc", "main"));

        let info = server.remote_ref_info("r1", "origin", "main").await.unwrap();
        assert_eq!(info.state.unwrap().base.git_base, "abc");
        let missing = server.remote_ref_info("r1", "origin", "dev").await.unwrap();
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn symbolic_refs_stay_local() {
        let (server, net) = started();
        server.update_ref("r2", "main", RefState::new("v1", "main")).await.unwrap();
        server.set_symbolic_ref("r2", "HEAD", "main").await.unwrap();

        let repo = server.repos().require("r2").unwrap();
        let state = repo.lock().await;
        let (resolved, _) = state.refdb.resolve("HEAD").unwrap();
        assert_eq!(resolved, "main");
        assert!(net.latest("peerA").is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_and_refuses_dials() {
        let (server, net) = started();
        server.watch_remote("r1", "origin").await.unwrap();

        server.shutdown().await;
        assert!(server.is_shutting_down());
        assert!(net.latest("peerA").unwrap().is_disconnected());
        assert!(server.remotes().connected_endpoints().is_empty());
        assert!(server.watch_remote("r1", "origin").await.is_err());
        assert_eq!(net.dial_count("peerA"), 1);
    }
}
