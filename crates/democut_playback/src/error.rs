use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("failed to start player: {0}")]
    Spawn(std::io::Error),

    #[error("player socket did not appear at {0}")]
    SocketTimeout(PathBuf),

    #[error("player IPC error: {0}")]
    Ipc(#[from] std::io::Error),

    #[error("player protocol error: {0}")]
    Protocol(String),

    #[error("player is not running")]
    NotRunning,

    #[error("playback worker failed: {0}")]
    Worker(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
