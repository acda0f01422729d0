//! The set of repositories hosted by a server.
//!
//! Membership is guarded by a short `RwLock`; each [`Repository`] carries its
//! own lock for refs and config. Callers that walk every repository take a
//! [`snapshot`](RepoRegistry::snapshot) and lock repositories one at a time.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use refmesh_refs::validate_ref_name;

use crate::error::{ServerError, ServerResult};
use crate::repo::{RepoConfig, Repository};

#[derive(Debug, Default)]
pub struct RepoRegistry {
    repos: RwLock<BTreeMap<String, Arc<Repository>>>,
}

impl RepoRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Repository>>> {
        self.repos.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Repository>>> {
        self.repos.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new repository.
    pub fn create(&self, name: &str, config: RepoConfig) -> ServerResult<Arc<Repository>> {
        validate_ref_name(name)?;
        config.validate()?;
        let mut repos = self.write();
        if repos.contains_key(name) {
            return Err(ServerError::RepoAlreadyExists(name.to_string()));
        }
        let repo = Arc::new(Repository::new(name, config));
        repos.insert(name.to_string(), Arc::clone(&repo));
        tracing::debug!(repo = name, "repository created");
        Ok(repo)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Repository>> {
        self.read().get(name).cloned()
    }

    /// Look up `name`, failing with [`ServerError::RepoNotFound`].
    pub fn require(&self, name: &str) -> ServerResult<Arc<Repository>> {
        self.get(name)
            .ok_or_else(|| ServerError::RepoNotFound(name.to_string()))
    }

    /// Return the repository, creating it with an empty config on first reference.
    pub fn get_or_create(&self, name: &str) -> ServerResult<Arc<Repository>> {
        if let Some(repo) = self.get(name) {
            return Ok(repo);
        }
        validate_ref_name(name)?;
        let mut repos = self.write();
        let repo = repos
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Repository::new(name, RepoConfig::default())));
        Ok(Arc::clone(repo))
    }

    pub fn remove(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Every repository at this instant, ordered by name.
    pub fn snapshot(&self) -> Vec<Arc<Repository>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_get() {
        let registry = RepoRegistry::new();
        registry.create("r1", RepoConfig::default()).unwrap();
        assert_eq!(registry.get("r1").unwrap().name(), "r1");
        assert!(registry.get("r2").is_none());
        assert!(matches!(
            registry.require("r2"),
            Err(ServerError::RepoNotFound(_))
        ));
    }

    #[test]
    fn duplicate_create_fails() {
        let registry = RepoRegistry::new();
        registry.create("r1", RepoConfig::default()).unwrap();
        assert!(matches!(
            registry.create("r1", RepoConfig::default()),
            Err(ServerError::RepoAlreadyExists(_))
        ));
    }

    #[test]
    fn get_or_create_is_stable() {
        let registry = RepoRegistry::new();
        let a = registry.get_or_create("r1").unwrap();
        let b = registry.get_or_create("r1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert!(registry.get_or_create("bad..name").is_err());
    }

    #[test]
    fn snapshot_and_remove() {
        let registry = RepoRegistry::new();
        registry.create("b", RepoConfig::default()).unwrap();
        registry.create("a", RepoConfig::default()).unwrap();
        assert_eq!(registry.names(), vec!["a", "b"]);

        let snap = registry.snapshot();
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        assert_eq!(snap.len(), 2);
        assert_eq!(registry.len(), 1);
    }
}
