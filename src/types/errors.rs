//! Resilience error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation. Every
//! caller-facing variant carries a severity tag so collaborators can decide
//! between retry, backoff, and escalation without string matching.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ResourceKind;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Severity attached to caller-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Why a timeout fired.
///
/// `Execution` means the operation itself ran past its deadline; `QueueWait`
/// means the task expired while still queued in a bulkhead and never ran;
/// `Cancelled` means the deadline table was force-cleared mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    Execution,
    QueueWait,
    Cancelled,
}

/// Main error enum for the resilience runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Per-kind resource cap hit. Retryable once headroom frees up.
    #[error("resource limit exceeded for {kind}: {message}")]
    ResourceLimitExceeded { kind: ResourceKind, message: String },

    /// Aggregate memory budget exhausted even after reclamation.
    /// Critical: not retryable without manual intervention.
    #[error("memory limit exceeded: requested {requested_bytes} bytes, limit {limit_bytes} bytes")]
    MemoryLimitExceeded {
        requested_bytes: u64,
        limit_bytes: u64,
    },

    /// Bulkhead is at capacity and its overflow queue is full.
    #[error("bulkhead '{name}' queue full")]
    BulkheadQueueFull { name: String },

    /// Deadline fired before the operation settled.
    #[error("'{label}' timed out after {timeout_ms}ms ({reason:?})")]
    Timeout {
        label: String,
        timeout_ms: u64,
        reason: TimeoutReason,
    },

    /// Error boundary is latched; work is rejected until explicit recovery.
    #[error("error boundary '{name}' breached ({error_count} errors in window)")]
    BoundaryBreached { name: String, error_count: usize },

    /// A release callback failed. The resource is removed from tracking
    /// regardless; this reports the callback failure to the caller.
    #[error("cleanup failed for resource {id}: {message}")]
    ResourceCleanupFailed { id: String, message: String },

    /// Unknown bulkhead/boundary/resource name.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal errors (panicking callbacks, broken handoff channels).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Severity tag for caller-facing triage.
    pub fn severity(&self) -> Severity {
        match self {
            Error::BulkheadQueueFull { .. } => Severity::Low,
            Error::ResourceLimitExceeded { .. } | Error::ResourceCleanupFailed { .. } => {
                Severity::Medium
            }
            Error::Timeout { .. } | Error::BoundaryBreached { .. } => Severity::High,
            Error::MemoryLimitExceeded { .. } => Severity::Critical,
            Error::NotFound(_) | Error::Internal(_) => Severity::Medium,
        }
    }

    /// Whether the caller may simply retry later without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ResourceLimitExceeded { .. } | Error::BulkheadQueueFull { .. }
        )
    }
}

// Convenience constructors
impl Error {
    pub fn limit_exceeded(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self::ResourceLimitExceeded {
            kind,
            message: message.into(),
        }
    }

    pub fn queue_full(name: impl Into<String>) -> Self {
        Self::BulkheadQueueFull { name: name.into() }
    }

    pub fn execution_timeout(label: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            label: label.into(),
            timeout_ms,
            reason: TimeoutReason::Execution,
        }
    }

    pub fn queue_timeout(label: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            label: label.into(),
            timeout_ms,
            reason: TimeoutReason::QueueWait,
        }
    }

    pub fn cancelled(label: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            label: label.into(),
            timeout_ms,
            reason: TimeoutReason::Cancelled,
        }
    }

    pub fn breached(name: impl Into<String>, error_count: usize) -> Self {
        Self::BoundaryBreached {
            name: name.into(),
            error_count,
        }
    }

    pub fn cleanup_failed(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceCleanupFailed {
            id: id.into(),
            message: message.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
