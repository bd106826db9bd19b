//! Error types for the publish pipeline.
//!
//! None of these are fatal to the agent. Each one ends up as descriptive
//! text on a status event while the queue keeps the data for a later tick.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("location service is disabled")]
    Unavailable,
    #[error("position read timed out after {0}s")]
    Timeout(u64),
    #[error("sensor read failed: {0}")]
    Read(String),
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out after {0}s")]
    Timeout(u64),
    #[error("broker rejected connection: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("connect attempt aborted")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("publish timed out after {0}s")]
    Timeout(u64),
    #[error("publish failed: {0}")]
    Client(String),
    #[error("session dropped before the broker acknowledged the publish")]
    Unacknowledged,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("interval must be at least one second, got {0}")]
    InvalidInterval(u64),
    #[error("unsupported qos level {0}, expected 1 or 2")]
    InvalidQos(u8),
}
