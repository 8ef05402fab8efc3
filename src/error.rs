//! Error types shared across the pipeline.
//!
//! Every fault is caught at the nearest unit boundary (host fetch, cluster
//! unit, HTTP request); nothing here is meant to reach the scheduler loop.

use thiserror::Error;

/// One failed listing fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed listing: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Row store failures (connect, schema, transaction, query).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode children ids: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// File sink failures.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode tree: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Startup precondition failures. These are the only fatal errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of one cluster's unit of work in a scheduler cycle.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("row store write failed: {0}")]
    Store(#[from] StoreError),

    #[error("file output failed: {0}")]
    Output(#[from] OutputError),
}
