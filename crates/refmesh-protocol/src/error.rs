use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid refspec {spec:?}: {reason}")]
    InvalidRefSpec { spec: String, reason: String },

    #[error("invalid params for {method}: {reason}")]
    InvalidParams { method: &'static str, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
