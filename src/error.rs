// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the xCluster consumer.
//!
//! Errors are categorized by how the poll/apply cycle reacts to them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `TryAgain` | Yes | Transient condition (empty key-range match, injected test failure) |
//! | `TimedOut` | Yes | Lookup or RPC exceeded its deadline |
//! | `Rpc` | Yes | Transport-level RPC failure |
//! | `TablePartitionListIsStale` | Yes | Consumer tablet split; partitions must be refreshed |
//! | `NotFound` | No | Missing mapping (skipped where the caller expects it) |
//! | `InvalidArgument` | No | Malformed input or missing collaborator |
//! | `IllegalState` | No | Internal invariant violated (e.g. missing write request) |
//! | `Internal` | No | Unexpected internal error |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Component is shutting down |
//!
//! # Retry Behavior
//!
//! A failed batch is never resumed mid-way. The poller retries the whole
//! poll/apply cycle from the last acknowledged [`OpId`](crate::types::OpId)
//! with backoff, regardless of category. [`XClusterError::is_retryable()`]
//! decides only the log level and the metric label.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for consumer operations.
pub type Result<T> = std::result::Result<T, XClusterError>;

/// Errors that can occur while polling or applying a batch.
///
/// The type is `Clone` so the same error can be recorded in batch state
/// and reported back in an [`OutputResult`](crate::output_client::OutputResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum XClusterError {
    /// Transient condition, retry the whole batch.
    #[error("Try again: {0}")]
    TryAgain(String),

    /// A lookup or RPC did not complete before its deadline.
    #[error("Timed out ({operation}) after {timeout:?}")]
    TimedOut { operation: String, timeout: Duration },

    /// Transport-level RPC failure.
    #[error("RPC error ({operation}): {message}")]
    Rpc { operation: String, message: String },

    /// The cached partition list of the consumer table no longer matches
    /// the cluster (a consumer-side tablet split happened).
    #[error("Table partition list is stale: {0}")]
    TablePartitionListIsStale(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invariant violation inside the consumer.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl XClusterError {
    /// Create an RPC error for the given operation.
    pub fn rpc(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error for the given operation.
    pub fn timed_out(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::TimedOut {
            operation: operation.into(),
            timeout,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TryAgain(_) => true,
            Self::TimedOut { .. } => true,
            Self::Rpc { .. } => true,
            Self::TablePartitionListIsStale(_) => true,
            Self::NotFound(_) => false,
            Self::InvalidArgument(_) => false,
            Self::IllegalState(_) => false,
            Self::Internal(_) => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
        }
    }

    /// Whether this error means the consumer table's partition cache must be refreshed.
    pub fn is_partition_list_stale(&self) -> bool {
        matches!(self, Self::TablePartitionListIsStale(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TryAgain(_) => "try_again",
            Self::TimedOut { .. } => "timed_out",
            Self::Rpc { .. } => "rpc",
            Self::TablePartitionListIsStale(_) => "partition_list_stale",
            Self::NotFound(_) => "not_found",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::IllegalState(_) => "illegal_state",
            Self::Internal(_) => "internal",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
        }
    }
}
