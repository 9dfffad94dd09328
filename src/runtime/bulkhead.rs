//! Per-workload bounded-concurrency admission queue.
//!
//! A bulkhead bounds logically concurrent in-flight operations for one named
//! workload and queues overflow up to a configured size instead of rejecting
//! immediately. Queued tasks are admitted in descending-priority order, FIFO
//! within equal priority. Admission handoff uses a oneshot channel; the
//! operation future itself never leaves the submitting task.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::types::{BulkheadConfig, Error, Result};

/// Ring-buffer bounds for recent execution times.
const RING_CAP: usize = 100;
const RING_TRIM: usize = 50;

/// A task waiting for a slot.
#[derive(Debug)]
struct QueuedTask {
    admit_tx: oneshot::Sender<Result<()>>,
    enqueued_at: Instant,
    priority: i32,
}

#[derive(Debug, Default)]
struct State {
    current_executions: usize,
    queue: Vec<QueuedTask>,
    total_executions: u64,
    success_count: u64,
    failure_count: u64,
    timeout_count: u64,
    recent_execution_times: Vec<Duration>,
}

enum Outcome {
    Success(Duration),
    Failure,
    Timeout,
}

/// Holds one execution slot. Dropping an armed permit returns the slot and
/// admits the next queued task, so a caller that cancels its `execute`
/// future mid-flight cannot shrink the bulkhead's capacity. Disarmed once
/// the outcome is recorded through `complete`, which frees the slot itself.
struct SlotPermit<'a> {
    bulkhead: &'a Bulkhead,
    armed: bool,
}

impl<'a> SlotPermit<'a> {
    fn armed(bulkhead: &'a Bulkhead) -> Self {
        Self {
            bulkhead,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SlotPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(
                "bulkhead_execute_cancelled: name={}",
                self.bulkhead.name
            );
            self.bulkhead.release_slot();
        }
    }
}

/// Metrics snapshot for one bulkhead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkheadMetrics {
    pub name: String,
    pub current_executions: usize,
    pub queued: usize,
    pub total_executions: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub timeout_count: u64,
    pub avg_execution_ms: f64,
    pub max_execution_ms: u64,
}

/// Bounded-concurrency admission gate for one named workload.
#[derive(Debug)]
pub struct Bulkhead {
    name: String,
    config: BulkheadConfig,
    state: Mutex<State>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, config: BulkheadConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Submit an operation. Runs immediately if a slot is free, queues if the
    /// overflow queue has room, otherwise fails with `BulkheadQueueFull`.
    /// Admitted operations race the per-bulkhead execution deadline.
    pub async fn execute<F, Fut, T>(&self, operation: F, priority: i32) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let waiter = {
            let mut state = self.lock_state();
            if state.current_executions < self.config.max_concurrent {
                state.current_executions += 1;
                None
            } else if state.queue.len() < self.config.queue_size {
                let (admit_tx, admit_rx) = oneshot::channel();
                state.queue.push(QueuedTask {
                    admit_tx,
                    enqueued_at: Instant::now(),
                    priority,
                });
                // Stable sort: FIFO order preserved among equal priorities.
                state.queue.sort_by(|a, b| b.priority.cmp(&a.priority));
                tracing::debug!(
                    "bulkhead_queued: name={}, priority={}, depth={}",
                    self.name,
                    priority,
                    state.queue.len()
                );
                Some(admit_rx)
            } else {
                tracing::warn!("bulkhead_queue_full: name={}", self.name);
                return Err(Error::queue_full(&self.name));
            }
        };

        let permit = match waiter {
            None => SlotPermit::armed(self),
            Some(admit_rx) => match admit_rx.await {
                Ok(Ok(())) => SlotPermit::armed(self),
                Ok(Err(err)) => return Err(err),
                Err(_) => {
                    return Err(Error::internal(format!(
                        "bulkhead '{}' admission channel closed",
                        self.name
                    )))
                }
            },
        };

        self.run(operation, permit).await
    }

    /// Expire queued tasks that have waited past the deadline without ever
    /// being admitted. Returns the number rejected. Driven by the
    /// orchestrator monitor so tasks cannot wait forever when no slot frees.
    pub fn expire_stale_queued(&self) -> usize {
        let timeout_ms = self.config.timeout.as_millis() as u64;
        let stale: Vec<QueuedTask> = {
            let mut state = self.lock_state();
            let mut kept = Vec::with_capacity(state.queue.len());
            let mut stale = Vec::new();
            for task in state.queue.drain(..) {
                if task.enqueued_at.elapsed() > self.config.timeout {
                    stale.push(task);
                } else {
                    kept.push(task);
                }
            }
            state.queue = kept;
            stale
        };

        let expired = stale.len();
        for task in stale {
            let _ = task
                .admit_tx
                .send(Err(Error::queue_timeout(&self.name, timeout_ms)));
        }
        if expired > 0 {
            tracing::warn!("bulkhead_queue_expired: name={}, count={}", self.name, expired);
        }
        expired
    }

    /// Block (by polling) until nothing is running or queued.
    pub async fn drain(&self) {
        loop {
            {
                let state = self.lock_state();
                if state.current_executions == 0 && state.queue.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Current metrics, including avg/max execution time over the ring buffer.
    pub fn metrics(&self) -> BulkheadMetrics {
        let state = self.lock_state();
        let times = &state.recent_execution_times;
        let avg_execution_ms = if times.is_empty() {
            0.0
        } else {
            times.iter().map(|d| d.as_secs_f64() * 1000.0).sum::<f64>() / times.len() as f64
        };
        let max_execution_ms = times
            .iter()
            .map(|d| d.as_millis() as u64)
            .max()
            .unwrap_or(0);

        BulkheadMetrics {
            name: self.name.clone(),
            current_executions: state.current_executions,
            queued: state.queue.len(),
            total_executions: state.total_executions,
            success_count: state.success_count,
            failure_count: state.failure_count,
            timeout_count: state.timeout_count,
            avg_execution_ms,
            max_execution_ms,
        }
    }

    async fn run<F, Fut, T>(&self, operation: F, mut permit: SlotPermit<'_>) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let raced = tokio::time::timeout(self.config.timeout, operation()).await;
        let elapsed = started.elapsed();
        // The outcome is recorded; `complete` frees the slot from here on.
        permit.disarm();

        match raced {
            Ok(Ok(value)) => {
                self.complete(Outcome::Success(elapsed));
                Ok(value)
            }
            Ok(Err(err)) => {
                self.complete(Outcome::Failure);
                Err(err)
            }
            Err(_) => {
                self.complete(Outcome::Timeout);
                tracing::warn!(
                    "bulkhead_execution_timeout: name={}, timeout_ms={}",
                    self.name,
                    self.config.timeout.as_millis()
                );
                Err(Error::execution_timeout(
                    &self.name,
                    self.config.timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Record an outcome, free the slot, and drain the queue head. Entirely
    /// synchronous: one lock, no suspension.
    fn complete(&self, outcome: Outcome) {
        let mut state = self.lock_state();

        state.total_executions += 1;
        match outcome {
            Outcome::Success(elapsed) => {
                state.success_count += 1;
                state.recent_execution_times.push(elapsed);
                if state.recent_execution_times.len() > RING_CAP {
                    let excess = state.recent_execution_times.len() - RING_TRIM;
                    state.recent_execution_times.drain(0..excess);
                }
            }
            Outcome::Failure => state.failure_count += 1,
            Outcome::Timeout => state.timeout_count += 1,
        }
        state.current_executions = state.current_executions.saturating_sub(1);
        self.admit_next(&mut state);
    }

    /// Return a slot without recording an outcome. Runs when a caller drops
    /// an admitted `execute` future before it settles.
    fn release_slot(&self) {
        let mut state = self.lock_state();
        state.current_executions = state.current_executions.saturating_sub(1);
        self.admit_next(&mut state);
    }

    /// Admit the queue head into a freed slot. Heads that waited past the
    /// deadline are rejected as queue timeouts and the next head is examined.
    fn admit_next(&self, state: &mut State) {
        let timeout_ms = self.config.timeout.as_millis() as u64;
        while !state.queue.is_empty() {
            let task = state.queue.remove(0);
            if task.enqueued_at.elapsed() > self.config.timeout {
                let _ = task
                    .admit_tx
                    .send(Err(Error::queue_timeout(&self.name, timeout_ms)));
                continue;
            }
            state.current_executions += 1;
            if task.admit_tx.send(Ok(())).is_err() {
                // Waiter went away (e.g. its task was dropped); give the
                // slot back and look at the next item.
                state.current_executions -= 1;
                continue;
            }
            break;
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
