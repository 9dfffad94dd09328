//! # Resilience Core - Admission Control & Failure Containment
//!
//! Resilience runtime embedded in a multi-agent coordination platform,
//! protecting shared finite resources from exhaustion, cascading failure,
//! and unbounded concurrency:
//! - Resource ledger with per-kind quotas and stale-allocation reclamation
//! - Per-workload bounded-concurrency admission queues (bulkheads)
//! - Leak-safe deadline racing with cooperative cancellation
//! - Latching failure-count error boundaries with explicit recovery
//! - Ordered, idempotent, best-effort emergency shutdown
//!
//! ## Architecture
//!
//! The orchestrator owns all subsystems and layers them around arbitrary
//! async operations; collaborators hold it behind an `Arc`:
//! ```text
//!                     ┌──────────────────────────────────┐
//!   collaborators  →  │     ResilienceOrchestrator       │
//!                     │  ┌─────────┐ ┌──────────────┐    │
//!                     │  │Resource │ │  Bulkheads   │    │
//!                     │  │ Ledger  │ │  (by name)   │    │
//!                     │  └─────────┘ └──────────────┘    │
//!                     │  ┌─────────┐ ┌──────────────┐    │
//!                     │  │Timeout  │ │Error         │    │
//!                     │  │Manager  │ │Boundaries    │    │
//!                     │  └─────────┘ └──────────────┘    │
//!                     │  ┌──────────────────────────┐    │
//!                     │  │ Emergency Shutdown       │    │
//!                     │  └──────────────────────────┘    │
//!                     └──────────────────────────────────┘
//! ```
//!
//! Layering contract for `execute_with_resilience`: bulkhead admission gates
//! *before* the timeout clock starts, so queueing delay never counts against
//! an operation's execution deadline.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod events;
pub mod runtime;
pub mod types;

// Internal utilities
pub mod observability;

pub use events::{EventBus, ResilienceEvent};
pub use runtime::{
    Bulkhead, BulkheadMetrics, EmergencyProcedure, EmergencyShutdownSystem, ErrorBoundary,
    ExecutionOptions, ResilienceOrchestrator, ResourceId, ResourceManager, SystemStatus,
    TimeoutManager,
};
pub use types::{Config, Error, LogFormat, ResourceKind, Result, Severity, TimeoutReason};
