use thiserror::Error;

/// Errors raised supervising a child process.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to resolve user `{0}`")]
    UnknownUser(String),
    #[error("failed to resolve group `{0}`")]
    UnknownGroup(String),
    #[error("failed to open {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to spawn child: {0}")]
    Spawn(std::io::Error),
}

/// Errors raised maintaining a peer link.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("connect to {0} failed: {1}")]
    Connect(String, std::io::Error),
    #[error("i/o error on peer link: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed envelope: {0}")]
    Protocol(#[from] serde_json::Error),
    #[error("tls handshake failed: {0}")]
    Tls(String),
    #[error("peer link timed out")]
    Timeout,
}

/// Errors raised by the configuration tree.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot index into non-object at `{0}`")]
    NotAnObject(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}
