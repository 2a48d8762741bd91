// src/errors.rs

//! Defines the primary error type shared by every replication component.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the engine.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum ReplError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("incomplete data in stream")]
    IncompleteData,

    #[error("connect to {addr} failed after {attempts} attempt(s): {reason}")]
    ConnectFailed {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("target rejected command: {0}")]
    TargetRejected(String),

    #[error("replication error: {0}")]
    Replication(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl ReplError {
    /// True for errors that `execute_with_retry` should treat as transient
    /// network failures worth reconnecting and retrying.
    pub fn is_transient_network(&self) -> bool {
        matches!(
            self,
            ReplError::Io(_) | ReplError::Timeout | ReplError::IncompleteData
        )
    }
}

impl From<std::io::Error> for ReplError {
    fn from(e: std::io::Error) -> Self {
        ReplError::Io(Arc::new(e))
    }
}

impl From<std::num::ParseIntError> for ReplError {
    fn from(e: std::num::ParseIntError) -> Self {
        ReplError::Protocol(format!("expected integer: {e}"))
    }
}

impl From<std::string::FromUtf8Error> for ReplError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        ReplError::Protocol(format!("invalid utf-8: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for ReplError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ReplError::Timeout
    }
}
