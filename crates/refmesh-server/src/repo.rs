//! Hosted repositories and their replication config.

use std::collections::BTreeMap;

use refmesh_protocol::RefSpec;
use refmesh_refs::{validate_ref_name, validate_remote_name, RefDb};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{ServerError, ServerResult};

/// Where a remote lives and what to watch there.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Address of the peer server.
    pub endpoint: String,
    /// Repository name on the peer.
    pub repo: String,
    #[serde(default)]
    pub refspec: RefSpec,
}

/// Replication settings for one local ref.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefConfig {
    /// Name of the remote this ref tracks.
    pub upstream: String,
    /// The upstream is authoritative; local state is a cache of it.
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Remotes keyed by remote name.
    #[serde(default)]
    pub remotes: BTreeMap<String, RemoteConfig>,
    /// Per-ref replication keyed by ref name.
    #[serde(default)]
    pub refs: BTreeMap<String, RefConfig>,
}

impl RepoConfig {
    /// Check names and that every ref's upstream is a configured remote.
    pub fn validate(&self) -> ServerResult<()> {
        for (name, remote) in &self.remotes {
            validate_remote_name(name)?;
            if remote.endpoint.is_empty() {
                return Err(ServerError::Config(format!("remote {name}: empty endpoint")));
            }
        }
        for (name, ref_config) in &self.refs {
            validate_ref_name(name)?;
            if !self.remotes.contains_key(&ref_config.upstream) {
                return Err(ServerError::Config(format!(
                    "ref {name}: upstream {} is not a configured remote",
                    ref_config.upstream
                )));
            }
        }
        Ok(())
    }

    /// Remotes served by `endpoint`.
    pub fn remotes_at<'a>(
        &'a self,
        endpoint: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a RemoteConfig)> + 'a {
        self.remotes
            .iter()
            .filter(move |(_, r)| r.endpoint == endpoint)
            .map(|(name, r)| (name.as_str(), r))
    }

    /// Refs whose authoritative copy lives on `remote`.
    pub fn overwrite_refs_of<'a>(&'a self, remote: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.refs
            .iter()
            .filter(move |(_, c)| c.overwrite && c.upstream == remote)
            .map(|(name, _)| name.as_str())
    }

    /// The remote `ref_name` tracks, if any.
    pub fn upstream_of(&self, ref_name: &str) -> Option<(&str, &RemoteConfig)> {
        let ref_config = self.refs.get(ref_name)?;
        let remote = self.remotes.get(&ref_config.upstream)?;
        Some((ref_config.upstream.as_str(), remote))
    }
}

/// Everything the repository lock guards.
#[derive(Debug, Default)]
pub struct RepoState {
    pub refdb: RefDb,
    pub config: RepoConfig,
}

/// A hosted repository.
#[derive(Debug)]
pub struct Repository {
    name: String,
    state: Mutex<RepoState>,
}

impl Repository {
    pub fn new(name: impl Into<String>, config: RepoConfig) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RepoState {
                refdb: RefDb::new(),
                config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock refs and config together.
    pub async fn lock(&self) -> MutexGuard<'_, RepoState> {
        self.state.lock().await
    }
}
