use std::collections::BTreeMap;
use std::path::Path;

use refmesh_sync::BackoffConfig;
use serde::{Deserialize, Serialize};

use crate::error::ServerResult;
use crate::repo::RepoConfig;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Re-dial schedule after a remote disconnects.
    pub backoff: BackoffConfig,
    /// Repositories created at startup.
    pub repos: BTreeMap<String, RepoConfig>,
}

impl ServerConfig {
    pub fn from_toml_str(s: &str) -> ServerResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the backoff schedule and every repository.
    pub fn validate(&self) -> ServerResult<()> {
        self.backoff.validate()?;
        for repo in self.repos.values() {
            repo.validate()?;
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading server config");
        Self::from_toml_str(&text)
    }
}
