//! Configuration structures.
//!
//! All knobs are explicit structs with documented defaults. Partial overrides
//! use struct-update syntax (`..Default::default()`); nothing is merged
//! dynamically at runtime.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Per-kind resource caps.
    #[serde(default)]
    pub limits: ResourceLimits,

    /// Stale-resource sweep behavior.
    #[serde(default)]
    pub sweep: SweepConfig,

    /// Orchestrator monitor loop behavior.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Output format for the bundled tracing subscriber
    /// (`observability::init_tracing`). Ignored by hosts that install their
    /// own subscriber.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Output format for the bundled tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Per-kind numeric caps. Immutable once the orchestrator is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum open file handles.
    pub max_file_handles: usize,

    /// Maximum network connections.
    pub max_network_connections: usize,

    /// Maximum live WASM instances.
    pub max_wasm_instances: usize,

    /// Maximum live agents.
    pub max_agents: usize,

    /// Maximum database connections.
    pub max_database_connections: usize,

    /// Aggregate memory budget in MB (memory-kind allocations only).
    pub max_memory_mb: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_file_handles: 256,
            max_network_connections: 128,
            max_wasm_instances: 16,
            max_agents: 64,
            max_database_connections: 32,
            max_memory_mb: 512,
        }
    }
}

impl ResourceLimits {
    /// Aggregate memory budget in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }
}

/// Configuration for the periodic stale-resource sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// How often the sweep runs (default: 5 minutes).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Age past which a resource is considered stale (default: 30 minutes).
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,

    /// Maximum resources reclaimed per pass (default: 10).
    pub reclaim_batch: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(30 * 60),
            reclaim_batch: 10,
        }
    }
}

/// Configuration for the orchestrator's monitor loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How often queued-task expiry and status logging run (default: 30s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// Per-workload bulkhead configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadConfig {
    /// Maximum logically concurrent in-flight operations.
    pub max_concurrent: usize,

    /// Overflow queue capacity; beyond this, submissions are rejected.
    pub queue_size: usize,

    /// Per-operation execution deadline, also the maximum queue wait.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            queue_size: 32,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Per-workload error-boundary configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Error count within the window that latches the boundary.
    pub max_errors: usize,

    /// Sliding window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            window: Duration::from_secs(60),
        }
    }
}
