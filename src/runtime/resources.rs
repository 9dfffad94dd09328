//! Resource ledger: per-kind quotas, ownership indices, reclamation.
//!
//! Tracks every finite allocation (memory blocks, handles, connections,
//! WASM instances, agents) by kind and owner, enforces the configured caps,
//! and reclaims stale allocations both under memory pressure and on a
//! periodic sweep. All ledger mutations happen in synchronous sections; the
//! lock is never held across an await.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use uuid::Uuid;

use crate::events::{EventBus, ResilienceEvent};
use crate::types::{Error, ResourceKind, ResourceLimits, Result, SweepConfig};

/// Release hook invoked when a resource is released or reclaimed.
pub type ReleaseFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Identifier for a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(Uuid);

impl ResourceId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One tracked allocation.
struct ResourceEntry {
    id: ResourceId,
    kind: ResourceKind,
    owner: String,
    allocated_at: DateTime<Utc>,
    size_bytes: u64,
    release: Option<ReleaseFn>,
}

impl std::fmt::Debug for ResourceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("owner", &self.owner)
            .field("allocated_at", &self.allocated_at)
            .field("size_bytes", &self.size_bytes)
            .field("has_release", &self.release.is_some())
            .finish()
    }
}

/// Snapshot of ledger occupancy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub total: usize,
    pub by_kind: HashMap<ResourceKind, usize>,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
}

/// Statistics from one reclamation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReclaimStats {
    /// Resources released this pass.
    pub reclaimed: usize,
    /// Release callbacks that failed (resources removed regardless).
    pub release_errors: usize,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Indexed ledger state. Invariant: every live id appears in `resources`,
/// exactly one `by_kind` bucket, and exactly one `by_owner` bucket;
/// `memory_bytes` is the sum of memory-kind entry sizes.
#[derive(Debug, Default)]
struct Ledger {
    resources: HashMap<ResourceId, ResourceEntry>,
    by_kind: HashMap<ResourceKind, HashSet<ResourceId>>,
    by_owner: HashMap<String, HashSet<ResourceId>>,
    memory_bytes: u64,
}

impl Ledger {
    fn insert(&mut self, entry: ResourceEntry) {
        self.by_kind.entry(entry.kind).or_default().insert(entry.id);
        self.by_owner
            .entry(entry.owner.clone())
            .or_default()
            .insert(entry.id);
        if entry.kind == ResourceKind::Memory {
            self.memory_bytes += entry.size_bytes;
        }
        self.resources.insert(entry.id, entry);
    }

    fn remove(&mut self, id: &ResourceId) -> Option<ResourceEntry> {
        let entry = self.resources.remove(id)?;
        if let Some(ids) = self.by_kind.get_mut(&entry.kind) {
            ids.remove(id);
        }
        if let Some(ids) = self.by_owner.get_mut(&entry.owner) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_owner.remove(&entry.owner);
            }
        }
        if entry.kind == ResourceKind::Memory {
            self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);
        }
        Some(entry)
    }

    fn kind_count(&self, kind: ResourceKind) -> usize {
        self.by_kind.get(&kind).map(HashSet::len).unwrap_or(0)
    }

    /// Remove up to `limit` entries older than `cutoff`, oldest first.
    fn take_stale(&mut self, cutoff: DateTime<Utc>, limit: usize) -> Vec<ResourceEntry> {
        let mut stale: Vec<(DateTime<Utc>, ResourceId)> = self
            .resources
            .values()
            .filter(|entry| entry.allocated_at < cutoff)
            .map(|entry| (entry.allocated_at, entry.id))
            .collect();
        stale.sort_by_key(|(allocated_at, _)| *allocated_at);

        stale
            .into_iter()
            .take(limit)
            .filter_map(|(_, id)| self.remove(&id))
            .collect()
    }
}

/// Resource manager - the quota-enforcing ledger.
///
/// Owned by the orchestrator, shared via `Arc`. The periodic sweep is a
/// spawned task stopped through a oneshot channel.
#[derive(Debug)]
pub struct ResourceManager {
    limits: ResourceLimits,
    sweep: SweepConfig,
    ledger: Mutex<Ledger>,
    events: Option<EventBus>,
    sweep_stop: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl ResourceManager {
    pub fn new(limits: ResourceLimits, sweep: SweepConfig) -> Self {
        Self {
            limits,
            sweep,
            ledger: Mutex::new(Ledger::default()),
            events: None,
            sweep_stop: Mutex::new(None),
        }
    }

    /// Attach an event bus; reclamation passes publish `ResourcesReclaimed`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Allocate a resource, enforcing the per-kind cap (aggregate MB for
    /// memory). Memory pressure first triggers one reclamation pass; only if
    /// the budget is still exceeded does allocation fail, and that failure is
    /// critical.
    pub async fn allocate(
        &self,
        kind: ResourceKind,
        owner: &str,
        size_bytes: u64,
        release: Option<ReleaseFn>,
    ) -> Result<ResourceId> {
        if kind == ResourceKind::Memory && !self.memory_fits(size_bytes) {
            let stats = self.reclaim_stale_pass().await;
            tracing::info!(
                "memory_pressure_reclaim: reclaimed={}, errors={}",
                stats.reclaimed,
                stats.release_errors
            );
            if !self.memory_fits(size_bytes) {
                return Err(Error::MemoryLimitExceeded {
                    requested_bytes: size_bytes,
                    limit_bytes: self.limits.max_memory_bytes(),
                });
            }
        }

        let entry = ResourceEntry {
            id: ResourceId::generate(),
            kind,
            owner: owner.to_string(),
            allocated_at: Utc::now(),
            size_bytes,
            release,
        };
        let id = entry.id;

        let mut ledger = self.lock_ledger();
        if kind == ResourceKind::Memory {
            // Re-check under the lock; a concurrent allocation may have
            // consumed the headroom the reclamation pass freed.
            if !Self::fits(ledger.memory_bytes, size_bytes, self.limits.max_memory_bytes()) {
                return Err(Error::MemoryLimitExceeded {
                    requested_bytes: size_bytes,
                    limit_bytes: self.limits.max_memory_bytes(),
                });
            }
        } else {
            let cap = self.kind_cap(kind);
            if ledger.kind_count(kind) >= cap {
                return Err(Error::limit_exceeded(
                    kind,
                    format!("{} of {} in use", ledger.kind_count(kind), cap),
                ));
            }
        }
        ledger.insert(entry);
        drop(ledger);

        tracing::debug!(
            "resource_allocated: id={}, kind={}, owner={}, size_bytes={}",
            id,
            kind,
            owner,
            size_bytes
        );
        Ok(id)
    }

    /// Release one resource. The stored callback is invoked and the resource
    /// is removed from every index regardless of the callback outcome;
    /// a failing callback surfaces as `ResourceCleanupFailed`.
    pub async fn release(&self, id: ResourceId) -> Result<()> {
        let entry = self
            .lock_ledger()
            .remove(&id)
            .ok_or_else(|| Error::not_found(format!("resource {id}")))?;

        if let Some(release) = entry.release {
            if let Err(err) = release().await {
                tracing::warn!("release_callback_failed: id={}, error={}", id, err);
                return Err(Error::cleanup_failed(id.to_string(), err.to_string()));
            }
        }
        tracing::debug!("resource_released: id={}, kind={}", id, entry.kind);
        Ok(())
    }

    /// Release every resource belonging to an owner, concurrently. Individual
    /// callback failures are logged, never propagated. Returns the number of
    /// resources released.
    pub async fn release_by_owner(&self, owner: &str) -> usize {
        let entries: Vec<ResourceEntry> = {
            let mut ledger = self.lock_ledger();
            let ids: Vec<ResourceId> = ledger
                .by_owner
                .get(owner)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            ids.iter().filter_map(|id| ledger.remove(id)).collect()
        };

        let count = entries.len();
        Self::run_releases(entries).await;
        if count > 0 {
            tracing::info!("owner_resources_released: owner={}, count={}", owner, count);
        }
        count
    }

    /// One reclamation pass: release up to `reclaim_batch` resources older
    /// than `stale_after`, oldest first.
    pub async fn reclaim_stale_pass(&self) -> ReclaimStats {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.sweep.stale_after)
                .unwrap_or_else(|_| ChronoDuration::seconds(1800));
        let entries = self
            .lock_ledger()
            .take_stale(cutoff, self.sweep.reclaim_batch);

        let reclaimed = entries.len();
        let release_errors = Self::run_releases(entries).await;

        if reclaimed > 0 {
            if let Some(events) = &self.events {
                events.publish(ResilienceEvent::ResourcesReclaimed { count: reclaimed });
            }
        }

        ReclaimStats {
            reclaimed,
            release_errors,
            completed_at: Some(Utc::now()),
        }
    }

    /// Release every tracked resource regardless of age. Emergency shutdown
    /// only. Returns the number released.
    pub async fn emergency_cleanup(&self) -> usize {
        let entries: Vec<ResourceEntry> = {
            let mut ledger = self.lock_ledger();
            let ids: Vec<ResourceId> = ledger.resources.keys().copied().collect();
            ids.iter().filter_map(|id| ledger.remove(id)).collect()
        };

        let count = entries.len();
        Self::run_releases(entries).await;
        tracing::warn!("emergency_cleanup_completed: released={}", count);
        count
    }

    /// Start the periodic stale-resource sweep in the background.
    pub fn start_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        let sweep_interval = manager.sweep.interval;
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        if let Ok(mut slot) = manager.sweep_stop.lock() {
            *slot = Some(stop_tx);
        }

        tokio::spawn(async move {
            let mut ticker = interval(sweep_interval);
            // First tick fires immediately; skip it so the sweep waits a full
            // interval before the first pass.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = manager.reclaim_stale_pass().await;
                        tracing::debug!(
                            "sweep_completed: reclaimed={}, errors={}",
                            stats.reclaimed,
                            stats.release_errors
                        );
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("resource_sweep_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the periodic sweep.
    pub fn stop_sweep(&self) {
        if let Ok(mut slot) = self.sweep_stop.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> ResourceStats {
        let ledger = self.lock_ledger();
        let mut by_kind = HashMap::new();
        for kind in ResourceKind::ALL {
            by_kind.insert(kind, ledger.kind_count(kind));
        }
        ResourceStats {
            total: ledger.resources.len(),
            by_kind,
            memory_bytes: ledger.memory_bytes,
            memory_limit_bytes: self.limits.max_memory_bytes(),
        }
    }

    /// Number of live resources owned by `owner`.
    pub fn owner_count(&self, owner: &str) -> usize {
        self.lock_ledger()
            .by_owner
            .get(owner)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    fn memory_fits(&self, size_bytes: u64) -> bool {
        Self::fits(
            self.lock_ledger().memory_bytes,
            size_bytes,
            self.limits.max_memory_bytes(),
        )
    }

    /// Overflow-safe budget check; a sum that wraps does not fit.
    fn fits(used: u64, requested: u64, limit: u64) -> bool {
        used.checked_add(requested)
            .is_some_and(|total| total <= limit)
    }

    fn kind_cap(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::File => self.limits.max_file_handles,
            ResourceKind::Network => self.limits.max_network_connections,
            ResourceKind::WasmInstance => self.limits.max_wasm_instances,
            ResourceKind::Agent => self.limits.max_agents,
            ResourceKind::DatabaseConnection => self.limits.max_database_connections,
            // Memory is capped by aggregate bytes, not count.
            ResourceKind::Memory => usize::MAX,
        }
    }

    fn lock_ledger(&self) -> std::sync::MutexGuard<'_, Ledger> {
        match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run release callbacks concurrently; returns the failure count.
    async fn run_releases(entries: Vec<ResourceEntry>) -> usize {
        let futures: Vec<_> = entries
            .into_iter()
            .filter_map(|entry| entry.release.map(|release| (entry.id, release)))
            .map(|(id, release)| async move {
                match release().await {
                    Ok(()) => 0usize,
                    Err(err) => {
                        tracing::warn!("release_callback_failed: id={}, error={}", id, err);
                        1
                    }
                }
            })
            .collect();
        join_all(futures).await.into_iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small_limits() -> ResourceLimits {
        ResourceLimits {
            max_file_handles: 2,
            max_network_connections: 2,
            max_wasm_instances: 1,
            max_agents: 4,
            max_database_connections: 2,
            max_memory_mb: 1,
        }
    }

    fn manager() -> ResourceManager {
        ResourceManager::new(small_limits(), SweepConfig::default())
    }

    fn counting_release(counter: Arc<AtomicUsize>) -> ReleaseFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[tokio::test]
    async fn allocates_up_to_kind_cap() {
        let rm = manager();
        rm.allocate(ResourceKind::File, "cache", 0, None)
            .await
            .unwrap();
        rm.allocate(ResourceKind::File, "cache", 0, None)
            .await
            .unwrap();

        let err = rm
            .allocate(ResourceKind::File, "cache", 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceLimitExceeded { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn release_restores_headroom() {
        let rm = manager();
        let id1 = rm
            .allocate(ResourceKind::WasmInstance, "sandbox", 0, None)
            .await
            .unwrap();
        assert!(rm
            .allocate(ResourceKind::WasmInstance, "sandbox", 0, None)
            .await
            .is_err());

        rm.release(id1).await.unwrap();
        rm.allocate(ResourceKind::WasmInstance, "sandbox", 0, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn memory_cap_is_aggregate_bytes() {
        let rm = manager(); // 1 MB budget
        rm.allocate(ResourceKind::Memory, "cache", 600 * 1024, None)
            .await
            .unwrap();

        let err = rm
            .allocate(ResourceKind::Memory, "cache", 600 * 1024, None)
            .await
            .unwrap_err();
        match err {
            Error::MemoryLimitExceeded { limit_bytes, .. } => {
                assert_eq!(limit_bytes, 1024 * 1024);
            }
            other => panic!("expected memory limit, got {other:?}"),
        }
        assert_eq!(err.severity(), crate::types::Severity::Critical);
    }

    #[tokio::test]
    async fn memory_pressure_reclaims_stale_entries() {
        let sweep = SweepConfig {
            stale_after: std::time::Duration::from_millis(10),
            ..Default::default()
        };
        let rm = ResourceManager::new(small_limits(), sweep);
        let released = Arc::new(AtomicUsize::new(0));

        rm.allocate(
            ResourceKind::Memory,
            "cache",
            900 * 1024,
            Some(counting_release(released.clone())),
        )
        .await
        .unwrap();

        // Age the first allocation past the staleness threshold.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        // Over budget, but the stale block is reclaimable.
        rm.allocate(ResourceKind::Memory, "cache", 900 * 1024, None)
            .await
            .unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(rm.stats().memory_bytes, 900 * 1024);
    }

    #[tokio::test]
    async fn absurd_memory_request_is_rejected_not_wrapped() {
        let rm = manager(); // 1 MB budget
        rm.allocate(ResourceKind::Memory, "cache", 600 * 1024, None)
            .await
            .unwrap();

        // used + requested would overflow u64; must fail cleanly.
        let err = rm
            .allocate(ResourceKind::Memory, "cache", u64::MAX, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MemoryLimitExceeded { .. }));
        assert_eq!(rm.stats().total, 1);
        assert_eq!(rm.stats().memory_bytes, 600 * 1024);
    }

    #[tokio::test]
    async fn fresh_entries_survive_memory_pressure() {
        let rm = manager(); // stale_after = 30 min, nothing is stale
        rm.allocate(ResourceKind::Memory, "cache", 900 * 1024, None)
            .await
            .unwrap();

        let err = rm
            .allocate(ResourceKind::Memory, "cache", 900 * 1024, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MemoryLimitExceeded { .. }));
        assert_eq!(rm.stats().total, 1);
    }

    #[tokio::test]
    async fn reclaim_pass_respects_batch_limit() {
        let sweep = SweepConfig {
            stale_after: std::time::Duration::from_millis(1),
            reclaim_batch: 10,
            ..Default::default()
        };
        let limits = ResourceLimits {
            max_agents: 64,
            ..small_limits()
        };
        let rm = ResourceManager::new(limits, sweep);

        for _ in 0..15 {
            rm.allocate(ResourceKind::Agent, "swarm", 0, None)
                .await
                .unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stats = rm.reclaim_stale_pass().await;
        assert_eq!(stats.reclaimed, 10);
        assert_eq!(rm.stats().total, 5);
    }

    #[tokio::test]
    async fn release_failure_still_removes_resource() {
        let rm = manager();
        let failing: ReleaseFn =
            Arc::new(|| Box::pin(async { Err(Error::internal("handle already closed")) }));
        let id = rm
            .allocate(ResourceKind::File, "cache", 0, Some(failing))
            .await
            .unwrap();

        let err = rm.release(id).await.unwrap_err();
        assert!(matches!(err, Error::ResourceCleanupFailed { .. }));
        assert_eq!(rm.stats().total, 0);
        // Slot is free again despite the failed callback.
        rm.allocate(ResourceKind::File, "cache", 0, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_by_owner_contains_failures() {
        let rm = manager();
        let released = Arc::new(AtomicUsize::new(0));
        let failing: ReleaseFn = Arc::new(|| Box::pin(async { Err(Error::internal("boom")) }));

        rm.allocate(
            ResourceKind::Agent,
            "swarm-7",
            0,
            Some(counting_release(released.clone())),
        )
        .await
        .unwrap();
        rm.allocate(ResourceKind::Agent, "swarm-7", 0, Some(failing))
            .await
            .unwrap();
        rm.allocate(ResourceKind::Agent, "other", 0, None)
            .await
            .unwrap();

        let count = rm.release_by_owner("swarm-7").await;
        assert_eq!(count, 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(rm.owner_count("swarm-7"), 0);
        assert_eq!(rm.owner_count("other"), 1);
    }

    #[tokio::test]
    async fn emergency_cleanup_releases_everything() {
        let rm = manager();
        let released = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            rm.allocate(
                ResourceKind::Agent,
                "swarm",
                0,
                Some(counting_release(released.clone())),
            )
            .await
            .unwrap();
        }

        let count = rm.emergency_cleanup().await;
        assert_eq!(count, 3);
        assert_eq!(released.load(Ordering::SeqCst), 3);
        assert_eq!(rm.stats().total, 0);
    }

    #[tokio::test]
    async fn sweep_task_start_stop() {
        let sweep = SweepConfig {
            interval: std::time::Duration::from_millis(10),
            stale_after: std::time::Duration::from_millis(1),
            ..Default::default()
        };
        let rm = Arc::new(ResourceManager::new(small_limits(), sweep));
        rm.allocate(ResourceKind::Agent, "swarm", 0, None)
            .await
            .unwrap();

        let handle = rm.clone().start_sweep();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(rm.stats().total, 0);

        rm.stop_sweep();
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("sweep should stop");
    }
}
