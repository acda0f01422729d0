use refmesh_protocol::RefIdentifier;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("repository not found: {0}")]
    RepoNotFound(String),

    #[error("repository already exists: {0}")]
    RepoAlreadyExists(String),

    #[error("repository {repo} has no remote named {remote}")]
    RemoteNotFound { repo: String, remote: String },

    #[error("ref {ref_id} from {endpoint} is not tracked by any repository")]
    NotTracked { endpoint: String, ref_id: RefIdentifier },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("ref error: {0}")]
    Ref(#[from] refmesh_refs::RefError),

    #[error("sync error: {0}")]
    Sync(#[from] refmesh_sync::SyncError),

    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
