//! Ordered best-effort emergency shutdown.
//!
//! Procedures run in ascending priority order, each bound by its own
//! deadline. A procedure that fails or times out is logged and skipped; one
//! stuck cleanup must never block the others. The whole sequence runs at
//! most once per process lifetime, guarded by a latch set before any work
//! starts so re-entrant calls from overlapping failure paths are safe.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::events::{EventBus, ResilienceEvent};
use crate::runtime::timeout::TimeoutManager;
use crate::types::Result;

/// Cleanup action run during emergency shutdown.
pub type ProcedureFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One registered shutdown step. Lower priority runs earlier.
pub struct EmergencyProcedure {
    pub name: String,
    pub priority: i32,
    pub timeout: Duration,
    pub action: ProcedureFn,
}

impl std::fmt::Debug for EmergencyProcedure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyProcedure")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Priority-ordered, idempotent shutdown sequencer.
#[derive(Debug)]
pub struct EmergencyShutdownSystem {
    timeouts: Arc<TimeoutManager>,
    procedures: Mutex<Vec<EmergencyProcedure>>,
    in_progress: AtomicBool,
    events: Option<EventBus>,
}

impl EmergencyShutdownSystem {
    pub fn new(timeouts: Arc<TimeoutManager>) -> Self {
        Self {
            timeouts,
            procedures: Mutex::new(Vec::new()),
            in_progress: AtomicBool::new(false),
            events: None,
        }
    }

    /// Attach an event bus; initiation publishes `EmergencyShutdown` exactly
    /// once, right after the latch is claimed.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a procedure. The list stays sorted ascending by priority;
    /// registration order breaks ties.
    pub fn add_procedure(&self, procedure: EmergencyProcedure) {
        if let Ok(mut procedures) = self.procedures.lock() {
            procedures.push(procedure);
            procedures.sort_by_key(|p| p.priority);
        }
    }

    /// Whether shutdown has been initiated.
    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Run the procedure list. Returns false without doing anything if a
    /// previous call already claimed the latch.
    pub async fn initiate(&self, reason: &str) -> bool {
        // Claim the latch before any work so overlapping failure paths
        // cannot run the list twice.
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("emergency_shutdown_already_in_progress: reason={}", reason);
            return false;
        }

        tracing::error!("emergency_shutdown_initiated: reason={}", reason);
        if let Some(events) = &self.events {
            events.publish(ResilienceEvent::EmergencyShutdown {
                reason: reason.to_string(),
            });
        }

        let steps: Vec<(String, Duration, ProcedureFn)> = match self.procedures.lock() {
            Ok(procedures) => procedures
                .iter()
                .map(|p| (p.name.clone(), p.timeout, Arc::clone(&p.action)))
                .collect(),
            Err(_) => Vec::new(),
        };

        for (name, timeout, action) in steps {
            match self.timeouts.with_timeout(action(), timeout, &name).await {
                Ok(()) => {
                    tracing::info!("shutdown_procedure_completed: name={}", name);
                }
                Err(err) => {
                    // Failure isolation: log and continue with the next step.
                    tracing::error!("shutdown_procedure_failed: name={}, error={}", name, err);
                }
            }
        }

        tracing::info!("emergency_shutdown_completed: reason={}", reason);
        true
    }
}
