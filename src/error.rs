//! Caller-visible error kinds
//!
//! Transport and protocol errors are rendered into one of these variants by
//! the event router before they reach a request handle.

use std::time::Duration;

use crate::key::DestinationKey;

/// Errors delivered to request callers
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The transport could not establish a connection
    #[error("connect error for {key}: {message}")]
    ConnectFailure { key: DestinationKey, message: String },

    /// The peer terminated the connection mid-exchange
    #[error("socket hang up: {0}")]
    PeerReset(String),

    /// The request was aborted by its caller, or its connection was destroyed locally
    #[error("socket hang up: aborted by caller")]
    AbortedByCaller,

    /// The per-request timer elapsed before completion
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// The request's task ended without an outcome (panic or runtime shutdown)
    #[error("internal pool error: {0}")]
    Internal(String),
}

impl PoolError {
    /// Hang-up class: peer-initiated termination or caller cancellation
    pub fn is_hang_up(&self) -> bool {
        matches!(self, PoolError::PeerReset(_) | PoolError::AbortedByCaller)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::RequestTimeout(_))
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, PoolError::ConnectFailure { .. })
    }
}
