// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication worker.
//!
//! Every failure inside a worker or reconciler resolves to one of four
//! outcomes, and the queue consumer decides a message's fate from that
//! outcome alone:
//!
//! | Error Type | Retryable | Disposition | Description |
//! |------------|-----------|-------------|-------------|
//! | `RecoverableDelivery` | Yes | Retain | Transient store/queue fault, redelivered after the lease |
//! | `Redis` | Yes | Retain | Queue or lock transport failure |
//! | `Store` | Yes | Retain | Ledger/replica SQLite failure |
//! | `PermanentRecord` | No | Acknowledge | Malformed or unsupported record |
//! | `Codec` | No | Acknowledge | Queue message body could not be decoded |
//! | `NotFound` | No | Acknowledge | Object already gone upstream |
//! | `LockUnavailable` | No | Retain | Lock contention (reconcilers treat as no-op) |
//! | `Config` | No | Retain | Configuration invalid |
//! | `InvalidState` | No | Retain | Service state machine violation |
//! | `Shutdown` | No | Retain | Service is shutting down |
//! | `Internal` | No | Retain | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! There is no in-process retry loop for record processing. A `Retain`
//! disposition leaves the message leased; the queue redelivers it once the
//! lease lapses. Reconciler failures are retried by the next scheduled run.

use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// What the consumer does with a message whose handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message; retrying cannot help.
    Acknowledge,
    /// Leave the message leased so the queue redelivers it.
    Retain,
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Transient fault talking to the replica, ledger or queue.
    #[error("Recoverable delivery error ({operation}): {message}")]
    RecoverableDelivery { operation: String, message: String },

    /// A record that can never be applied.
    ///
    /// Skipped and logged so its siblings in the batch still complete.
    #[error("Permanent record error (change {change_number}): {message}")]
    PermanentRecord { change_number: i64, message: String },

    /// The object no longer exists upstream. Treated as success.
    #[error("Object not found: {object_type}/{object_id}")]
    NotFound {
        object_type: String,
        object_id: String,
    },

    /// Another process holds the reconciliation lock.
    #[error("Lock unavailable: {key}")]
    LockUnavailable { key: String },

    /// Redis connection or command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQLite error in the ledger or replica store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Queue message body is not a valid change message.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn recoverable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RecoverableDelivery {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(change_number: i64, message: impl Into<String>) -> Self {
        Self::PermanentRecord {
            change_number,
            message: message.into(),
        }
    }

    pub fn not_found(object_type: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self::NotFound {
            object_type: object_type.into(),
            object_id: object_id.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RecoverableDelivery { .. } => true,
            Self::Redis { .. } => true,
            Self::Store(_) => true, // redelivery retries the whole message
            Self::PermanentRecord { .. } => false,
            Self::NotFound { .. } => false,
            Self::LockUnavailable { .. } => false,
            Self::Codec(_) => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Map this error onto the message fate the consumer applies.
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::PermanentRecord { .. } | Self::NotFound { .. } | Self::Codec(_) => {
                Disposition::Acknowledge
            }
            _ => Disposition::Retain,
        }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RecoverableDelivery { .. } => "recoverable",
            Self::PermanentRecord { .. } => "permanent",
            Self::NotFound { .. } => "not_found",
            Self::LockUnavailable { .. } => "lock_unavailable",
            Self::Redis { .. } => "redis",
            Self::Store(_) => "store",
            Self::Codec(_) => "codec",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for ReplicationError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<serde_json::Error> for ReplicationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
