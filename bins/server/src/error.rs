use std::path::PathBuf;

use lens_api::ClusterError;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("config ({context}): {detail}")]
    Config { context: &'static str, detail: String },

    #[error("log file {}: {source}", path.display())]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{0}")]
    Connection(#[from] ClusterError),

    #[error("backend '{0}' is not compiled in")]
    BackendUnavailable(&'static str),

    #[error("gateway: {0}")]
    Gateway(std::io::Error),

    #[error("gateway task: {0}")]
    Task(#[from] tokio::task::JoinError),
}
