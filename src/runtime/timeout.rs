//! Deadline racing with leak-free handle tracking.
//!
//! Every `with_timeout` call registers a handle in a shared table and removes
//! it on every exit path, so `active_timeouts()` returns 0 once all in-flight
//! calls have settled. `clear_all` force-cancels outstanding deadlines during
//! emergency shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::types::{Error, Result};

/// Tracks in-flight deadlines for a process.
///
/// NOT a global: owned by the orchestrator and shared via `Arc`.
#[derive(Debug, Default)]
pub struct TimeoutManager {
    active: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl TimeoutManager {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Race `operation` against a deadline.
    ///
    /// Losing the race stops *waiting*, not the underlying work; use
    /// [`with_deadline`](Self::with_deadline) when the operation can
    /// cooperate with cancellation.
    pub async fn with_timeout<F, T>(&self, operation: F, timeout: Duration, label: &str) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.with_deadline(|_token| operation, timeout, label).await
    }

    /// Cooperative variant: hands the operation a token that is cancelled
    /// when the deadline fires or `clear_all` runs, so the operation can
    /// abort at its own suspension points.
    pub async fn with_deadline<F, Fut, T>(
        &self,
        operation: F,
        timeout: Duration,
        label: &str,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = Uuid::new_v4();
        let token = CancellationToken::new();
        self.register(id, token.clone());

        // Biased: an operation that completes in the same poll as its
        // deadline or cancellation still counts as settled.
        let result = tokio::select! {
            biased;
            result = operation(token.child_token()) => result,
            () = tokio::time::sleep(timeout) => {
                tracing::warn!("deadline_exceeded: label={}, timeout_ms={}", label, timeout.as_millis());
                Err(Error::execution_timeout(label, timeout.as_millis() as u64))
            }
            () = token.cancelled() => {
                Err(Error::cancelled(label, timeout.as_millis() as u64))
            }
        };

        // Cancel before deregistering so cooperative children stop promptly.
        token.cancel();
        self.deregister(&id);
        result
    }

    /// Number of deadlines currently outstanding.
    pub fn active_timeouts(&self) -> usize {
        self.active.lock().map(|table| table.len()).unwrap_or(0)
    }

    /// Force-cancel every outstanding deadline. In-flight `with_timeout`
    /// calls fail with a `Cancelled`-tagged timeout error. Returns how many
    /// were cancelled.
    pub fn clear_all(&self) -> usize {
        let tokens: Vec<CancellationToken> = match self.active.lock() {
            Ok(table) => table.values().cloned().collect(),
            Err(_) => return 0,
        };
        let count = tokens.len();
        for token in tokens {
            token.cancel();
        }
        if count > 0 {
            tracing::warn!("timeouts_cleared: count={}", count);
        }
        count
    }

    fn register(&self, id: Uuid, token: CancellationToken) {
        if let Ok(mut table) = self.active.lock() {
            table.insert(id, token);
        }
    }

    fn deregister(&self, id: &Uuid) {
        if let Ok(mut table) = self.active.lock() {
            table.remove(id);
        }
    }
}
