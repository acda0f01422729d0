use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection to {0} is closed")]
    Closed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("update rejected by peer: {0}")]
    Rejected(String),

    #[error("invalid backoff config: {0}")]
    InvalidBackoff(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] refmesh_protocol::ProtocolError),
}

pub type SyncResult<T> = Result<T, SyncError>;
