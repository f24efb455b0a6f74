use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BellError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error), // Converts io::Error into BellError automatically

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError), // Converts rusqlite::Error automatically

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid ring spec: {0}")]
    InvalidRingSpec(String),

    #[error("Relay error: {0}")]
    RelayError(String),

    #[error("Playback error: {0}")]
    PlaybackError(String),

    #[error("Bell scheduler is not running")]
    SchedulerGone,

    #[error("Error: {0}")]
    Error(String), // Allows custom application errors
}
