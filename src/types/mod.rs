//! Shared types: resource kinds, errors, configuration.

pub mod config;
pub mod errors;

use serde::{Deserialize, Serialize};

pub use config::{
    BoundaryConfig, BulkheadConfig, Config, LogFormat, MonitorConfig, ResourceLimits, SweepConfig,
};
pub use errors::{Error, Result, Severity, TimeoutReason};

/// Kind of a tracked finite allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Memory,
    File,
    Network,
    WasmInstance,
    Agent,
    DatabaseConnection,
}

impl ResourceKind {
    /// All kinds, for stats iteration.
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Memory,
        ResourceKind::File,
        ResourceKind::Network,
        ResourceKind::WasmInstance,
        ResourceKind::Agent,
        ResourceKind::DatabaseConnection,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::File => "file",
            ResourceKind::Network => "network",
            ResourceKind::WasmInstance => "wasm-instance",
            ResourceKind::Agent => "agent",
            ResourceKind::DatabaseConnection => "database-connection",
        };
        f.write_str(s)
    }
}
