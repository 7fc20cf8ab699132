use lens_api::{ClusterError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("cluster: {0}")]
    Cluster(#[from] ClusterError),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("read {topic}/{partition}: no record within {timeout_ms} ms after offset {position}")]
    ReadTimeout {
        topic: String,
        partition: i32,
        position: i64,
        timeout_ms: u64,
    },

    #[error("keyword: {0}")]
    Keyword(#[from] regex::Error),

    #[error("poll supervisor stopped")]
    SupervisorStopped,
}

impl EngineError {
    /// Kind of the underlying cluster failure, if any.
    pub fn cluster_kind(&self) -> Option<ErrorKind> {
        match self {
            EngineError::Cluster(e) => Some(e.kind()),
            EngineError::ReadTimeout { .. } => Some(ErrorKind::Read),
            _ => None,
        }
    }
}
