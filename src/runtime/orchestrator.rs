//! Composition root: one resilience runtime per process.
//!
//! The orchestrator owns one resource manager, a name→bulkhead map, a
//! name→error-boundary map, one timeout manager, and the emergency shutdown
//! system, and layers them around arbitrary async operations. The layering
//! order is a contract: admission control (bulkhead) gates *before* the
//! timeout clock starts, so queueing delay never counts against an
//! operation's execution deadline.
//!
//! Constructed once at startup and shared via `Arc`; no ambient globals.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, ResilienceEvent};
use crate::runtime::boundary::{BoundaryStatus, ErrorBoundary, RecoveryFn};
use crate::runtime::bulkhead::{Bulkhead, BulkheadMetrics};
use crate::runtime::resources::{ReleaseFn, ResourceId, ResourceManager, ResourceStats};
use crate::runtime::shutdown::{EmergencyProcedure, EmergencyShutdownSystem};
use crate::runtime::timeout::TimeoutManager;
use crate::types::{BoundaryConfig, BulkheadConfig, Config, Error, ResourceKind, Result};

/// Per-call options for [`ResilienceOrchestrator::execute_with_resilience`].
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Execution deadline applied inside the bulkhead (if any).
    pub timeout: Option<Duration>,
    /// Named error boundary to route through.
    pub error_boundary: Option<String>,
    /// Named bulkhead to gate admission through.
    pub bulkhead: Option<String>,
    /// Queue priority within the bulkhead; higher runs earlier.
    pub priority: i32,
}

/// Structured snapshot of the whole runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    pub bulkheads: Vec<BulkheadMetrics>,
    pub boundaries: Vec<BoundaryStatus>,
    pub resources: ResourceStats,
    pub active_timeouts: usize,
    pub shutdown_in_progress: bool,
}

/// The resilience runtime.
#[derive(Debug)]
pub struct ResilienceOrchestrator {
    timeouts: Arc<TimeoutManager>,
    resources: Arc<ResourceManager>,
    // Arc so shutdown procedures can snapshot the map without holding `self`.
    bulkheads: Arc<RwLock<HashMap<String, Arc<Bulkhead>>>>,
    boundaries: RwLock<HashMap<String, Arc<ErrorBoundary>>>,
    shutdown: EmergencyShutdownSystem,
    events: EventBus,
    monitor_interval: Duration,
    monitor_stop: CancellationToken,
}

impl ResilienceOrchestrator {
    /// Build an orchestrator with the four known downstream workloads
    /// pre-registered and the default emergency procedures installed.
    /// Background tasks start on [`start`](Self::start).
    pub fn new(config: Config) -> Arc<Self> {
        let events = EventBus::default();
        let timeouts = Arc::new(TimeoutManager::new());
        let resources = Arc::new(
            ResourceManager::new(config.limits.clone(), config.sweep.clone())
                .with_events(events.clone()),
        );
        let shutdown =
            EmergencyShutdownSystem::new(Arc::clone(&timeouts)).with_events(events.clone());

        let orchestrator = Arc::new(Self {
            timeouts,
            resources,
            bulkheads: Arc::new(RwLock::new(HashMap::new())),
            boundaries: RwLock::new(HashMap::new()),
            shutdown,
            events,
            monitor_interval: config.monitor.interval,
            monitor_stop: CancellationToken::new(),
        });

        orchestrator.register_default_workloads();
        orchestrator.register_default_procedures();
        orchestrator
    }

    /// Default bulkheads/boundaries for the known downstream workloads, with
    /// values reflecting their load shape: sandboxed execution gets low
    /// concurrency and a short deadline, swarm coordination gets high
    /// concurrency and a large queue.
    fn register_default_workloads(&self) {
        let defaults: [(&str, BulkheadConfig, BoundaryConfig); 4] = [
            (
                "knowledge-cache",
                BulkheadConfig {
                    max_concurrent: 8,
                    queue_size: 50,
                    timeout: Duration::from_secs(10),
                },
                BoundaryConfig {
                    max_errors: 10,
                    window: Duration::from_secs(60),
                },
            ),
            (
                "retrieval",
                BulkheadConfig {
                    max_concurrent: 6,
                    queue_size: 40,
                    timeout: Duration::from_secs(15),
                },
                BoundaryConfig {
                    max_errors: 5,
                    window: Duration::from_secs(60),
                },
            ),
            (
                "swarm-coordination",
                BulkheadConfig {
                    max_concurrent: 16,
                    queue_size: 100,
                    timeout: Duration::from_secs(30),
                },
                BoundaryConfig {
                    max_errors: 8,
                    window: Duration::from_secs(120),
                },
            ),
            (
                "sandbox-execution",
                BulkheadConfig {
                    max_concurrent: 2,
                    queue_size: 10,
                    timeout: Duration::from_secs(5),
                },
                BoundaryConfig {
                    max_errors: 3,
                    window: Duration::from_secs(30),
                },
            ),
        ];

        for (name, bulkhead_config, boundary_config) in defaults {
            self.register_bulkhead(name, bulkhead_config);
            self.register_error_boundary(name, boundary_config, None);
        }
    }

    /// Default emergency procedures, in priority order: drain bulkheads,
    /// clear timeouts, emergency-cleanup resources, stop monitoring.
    fn register_default_procedures(&self) {
        let bulkheads = self.bulkheads_snapshot_fn();
        self.shutdown.add_procedure(EmergencyProcedure {
            name: "drain-bulkheads".to_string(),
            priority: 1,
            timeout: Duration::from_secs(10),
            action: Arc::new(move || {
                let bulkheads = bulkheads();
                Box::pin(async move {
                    join_all(bulkheads.iter().map(|bh| bh.drain())).await;
                    Ok(())
                })
            }),
        });

        let timeouts = Arc::clone(&self.timeouts);
        self.shutdown.add_procedure(EmergencyProcedure {
            name: "clear-timeouts".to_string(),
            priority: 2,
            timeout: Duration::from_secs(1),
            action: Arc::new(move || {
                let timeouts = Arc::clone(&timeouts);
                Box::pin(async move {
                    timeouts.clear_all();
                    Ok(())
                })
            }),
        });

        let resources = Arc::clone(&self.resources);
        self.shutdown.add_procedure(EmergencyProcedure {
            name: "emergency-cleanup-resources".to_string(),
            priority: 3,
            timeout: Duration::from_secs(30),
            action: Arc::new(move || {
                let resources = Arc::clone(&resources);
                Box::pin(async move {
                    resources.emergency_cleanup().await;
                    Ok(())
                })
            }),
        });

        let monitor_stop = self.monitor_stop.clone();
        let resources = Arc::clone(&self.resources);
        self.shutdown.add_procedure(EmergencyProcedure {
            name: "stop-monitoring".to_string(),
            priority: 4,
            timeout: Duration::from_secs(1),
            action: Arc::new(move || {
                let monitor_stop = monitor_stop.clone();
                let resources = Arc::clone(&resources);
                Box::pin(async move {
                    monitor_stop.cancel();
                    resources.stop_sweep();
                    Ok(())
                })
            }),
        });
    }

    /// Start background tasks: the resource sweep and the monitor loop that
    /// expires stale queued bulkhead tasks and logs a status line.
    pub fn start(&self) {
        Arc::clone(&self.resources).start_sweep();

        let bulkheads = Arc::clone(&self.bulkheads);
        let resources = Arc::clone(&self.resources);
        let timeouts = Arc::clone(&self.timeouts);
        let monitor_interval = self.monitor_interval;
        let stop = self.monitor_stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot: Vec<Arc<Bulkhead>> = bulkheads
                            .read()
                            .map(|map| map.values().cloned().collect())
                            .unwrap_or_default();
                        let expired: usize = snapshot
                            .iter()
                            .map(|bh| bh.expire_stale_queued())
                            .sum();
                        if expired > 0 {
                            tracing::warn!("monitor_expired_queued_tasks: count={}", expired);
                        }
                        tracing::debug!(
                            "monitor_tick: resources={}, active_timeouts={}",
                            resources.stats().total,
                            timeouts.active_timeouts()
                        );
                    }
                    () = stop.cancelled() => {
                        tracing::info!("monitor_stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Register (or replace) a named bulkhead.
    pub fn register_bulkhead(&self, name: &str, config: BulkheadConfig) -> Arc<Bulkhead> {
        let bulkhead = Arc::new(Bulkhead::new(name, config));
        if let Ok(mut map) = self.bulkheads.write() {
            map.insert(name.to_string(), Arc::clone(&bulkhead));
        }
        bulkhead
    }

    /// Register (or replace) a named error boundary. Breaches publish a
    /// `BoundaryBreached` event on the orchestrator's bus.
    pub fn register_error_boundary(
        &self,
        name: &str,
        config: BoundaryConfig,
        recovery: Option<RecoveryFn>,
    ) -> Arc<ErrorBoundary> {
        let events = self.events.clone();
        let event_name = name.to_string();
        let mut boundary =
            ErrorBoundary::new(name, config).with_on_breach(Arc::new(move |window| {
                events.publish(ResilienceEvent::BoundaryBreached {
                    name: event_name.clone(),
                    error_count: window.len(),
                });
            }));
        if let Some(recovery) = recovery {
            boundary = boundary.with_recovery(recovery);
        }

        let boundary = Arc::new(boundary);
        if let Ok(mut map) = self.boundaries.write() {
            map.insert(name.to_string(), Arc::clone(&boundary));
        }
        boundary
    }

    /// Execute an operation behind the configured resilience layers.
    ///
    /// The wrapped operation is `timeout(boundary(operation))`; when a
    /// bulkhead is named, the wrapped operation is submitted to it so the
    /// deadline clock only starts after admission.
    pub async fn execute_with_resilience<F, Fut, T>(
        &self,
        operation: F,
        options: ExecutionOptions,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let boundary = match &options.error_boundary {
            Some(name) => Some(self.error_boundary(name)?),
            None => None,
        };
        let bulkhead = match &options.bulkhead {
            Some(name) => Some(self.bulkhead(name)?),
            None => None,
        };

        let timeouts = Arc::clone(&self.timeouts);
        let timeout = options.timeout;
        let label = options
            .bulkhead
            .as_deref()
            .or(options.error_boundary.as_deref())
            .unwrap_or("operation")
            .to_string();

        let wrapped = move || async move {
            match (timeout, boundary) {
                (Some(t), Some(b)) => {
                    timeouts.with_timeout(b.execute(operation), t, &label).await
                }
                (Some(t), None) => {
                    timeouts
                        .with_timeout(async move { operation().await }, t, &label)
                        .await
                }
                (None, Some(b)) => b.execute(operation).await,
                (None, None) => operation().await,
            }
        };

        match bulkhead {
            Some(bh) => bh.execute(wrapped, options.priority).await,
            None => wrapped().await,
        }
    }

    /// Allocate a tracked resource. See [`ResourceManager::allocate`].
    pub async fn allocate_resource(
        &self,
        kind: ResourceKind,
        owner: &str,
        size_bytes: u64,
        release: Option<ReleaseFn>,
    ) -> Result<ResourceId> {
        self.resources.allocate(kind, owner, size_bytes, release).await
    }

    /// Release a tracked resource. See [`ResourceManager::release`].
    pub async fn release_resource(&self, id: ResourceId) -> Result<()> {
        self.resources.release(id).await
    }

    /// Release every resource an owner holds (collaborator teardown).
    pub async fn release_resources_by_owner(&self, owner: &str) -> usize {
        self.resources.release_by_owner(owner).await
    }

    /// Run the emergency shutdown sequence. Idempotent; returns whether this
    /// call performed the shutdown.
    pub async fn initiate_emergency_shutdown(&self, reason: &str) -> bool {
        self.shutdown.initiate(reason).await
    }

    /// Structured snapshot of the whole runtime.
    pub fn system_status(&self) -> SystemStatus {
        let mut bulkheads: Vec<BulkheadMetrics> = self
            .all_bulkheads()
            .iter()
            .map(|bh| bh.metrics())
            .collect();
        bulkheads.sort_by(|a, b| a.name.cmp(&b.name));

        let mut boundaries: Vec<BoundaryStatus> = self
            .boundaries
            .read()
            .map(|map| map.values().map(|b| b.status()).collect())
            .unwrap_or_default();
        boundaries.sort_by(|a, b| a.name.cmp(&b.name));

        SystemStatus {
            bulkheads,
            boundaries,
            resources: self.resources.stats(),
            active_timeouts: self.timeouts.active_timeouts(),
            shutdown_in_progress: self.shutdown.in_progress(),
        }
    }

    pub fn bulkhead(&self, name: &str) -> Result<Arc<Bulkhead>> {
        self.bulkheads
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| Error::not_found(format!("bulkhead '{name}'")))
    }

    pub fn error_boundary(&self, name: &str) -> Result<Arc<ErrorBoundary>> {
        self.boundaries
            .read()
            .ok()
            .and_then(|map| map.get(name).cloned())
            .ok_or_else(|| Error::not_found(format!("error boundary '{name}'")))
    }

    pub fn resource_manager(&self) -> Arc<ResourceManager> {
        Arc::clone(&self.resources)
    }

    pub fn timeout_manager(&self) -> Arc<TimeoutManager> {
        Arc::clone(&self.timeouts)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The shutdown sequencer, for registering collaborator procedures.
    pub fn shutdown_system(&self) -> &EmergencyShutdownSystem {
        &self.shutdown
    }

    fn all_bulkheads(&self) -> Vec<Arc<Bulkhead>> {
        self.bulkheads
            .read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Closure yielding a fresh bulkhead snapshot each call, so the drain
    /// procedure sees bulkheads registered after construction.
    fn bulkheads_snapshot_fn(&self) -> impl Fn() -> Vec<Arc<Bulkhead>> + Send + Sync {
        let bulkheads = Arc::clone(&self.bulkheads);
        move || {
            bulkheads
                .read()
                .map(|map| map.values().cloned().collect())
                .unwrap_or_default()
        }
    }
}
