use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open session to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Failed to run remote command on {host}: {reason}")]
    Exec { host: String, reason: String },

    #[error("Transfer {local} <-> {remote} failed: {reason}")]
    Transfer {
        local: PathBuf,
        remote: String,
        reason: String,
    },

    #[error("Unknown replica id: {0}")]
    UnknownReplica(usize),

    #[error("Unknown node id: {0}")]
    UnknownNode(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unable to parse batch job id from {0:?}")]
    JobIdParse(String),

    #[error("Batch scheduler error: {0}")]
    Batch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;
