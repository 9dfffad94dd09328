//! The resilience runtime primitives.
//!
//! Five tightly coupled primitives composed by the orchestrator: subsystems
//! are plain structs owned by (or shared from) the orchestrator, not separate
//! actors.

pub mod boundary;
pub mod bulkhead;
pub mod orchestrator;
pub mod resources;
pub mod shutdown;
pub mod timeout;

pub use boundary::{BoundaryStatus, ErrorBoundary, ErrorRecord};
pub use bulkhead::{Bulkhead, BulkheadMetrics};
pub use orchestrator::{ExecutionOptions, ResilienceOrchestrator, SystemStatus};
pub use resources::{ReleaseFn, ResourceId, ResourceManager, ResourceStats};
pub use shutdown::{EmergencyProcedure, EmergencyShutdownSystem, ProcedureFn};
pub use timeout::TimeoutManager;
