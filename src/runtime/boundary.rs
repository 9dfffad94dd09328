//! Latching error boundary.
//!
//! A circuit breaker keyed on error *count within a time window*, not error
//! rate over request count. Once the window fills to `max_errors` the
//! boundary latches breached and rejects work until `attempt_recovery`
//! succeeds. There is no automatic half-open probing: failure containment
//! must not silently heal without an external decision.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::types::{BoundaryConfig, Error, Result};

/// Callback invoked once per breach transition with the window contents.
pub type BreachFn = Arc<dyn Fn(&[ErrorRecord]) + Send + Sync>;

/// Async probe deciding whether the guarded dependency has recovered.
pub type RecoveryFn = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// One recorded error inside the sliding window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Status snapshot for one boundary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundaryStatus {
    pub name: String,
    pub breached: bool,
    pub error_count: usize,
    pub recovery_attempts: u32,
}

#[derive(Debug, Default)]
struct State {
    errors: Vec<ErrorRecord>,
    breached: bool,
    recovery_attempts: u32,
}

/// Latching failure-count circuit breaker for one named workload.
pub struct ErrorBoundary {
    name: String,
    config: BoundaryConfig,
    state: Mutex<State>,
    on_breach: Option<BreachFn>,
    recovery: Option<RecoveryFn>,
}

impl std::fmt::Debug for ErrorBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorBoundary")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("has_on_breach", &self.on_breach.is_some())
            .field("has_recovery", &self.recovery.is_some())
            .finish()
    }
}

impl ErrorBoundary {
    pub fn new(name: impl Into<String>, config: BoundaryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(State::default()),
            on_breach: None,
            recovery: None,
        }
    }

    /// Register a breach observer, invoked once per closed→breached
    /// transition. Panics inside the observer are caught and logged.
    pub fn with_on_breach(mut self, on_breach: BreachFn) -> Self {
        self.on_breach = Some(on_breach);
        self
    }

    /// Register the recovery probe consulted by `attempt_recovery`.
    pub fn with_recovery(mut self, recovery: RecoveryFn) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run an operation through the boundary. Fails fast while breached;
    /// otherwise failures are recorded into the window and rethrown.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        {
            let state = self.lock_state();
            if state.breached {
                return Err(Error::breached(&self.name, state.errors.len()));
            }
        }

        match operation().await {
            Ok(value) => Ok(value),
            Err(err) => {
                self.record_error(&err.to_string());
                Err(err)
            }
        }
    }

    /// Append an error, prune records older than the window, and latch on
    /// reaching `max_errors` while not already breached. Pruning happens
    /// here, never on a timer.
    pub fn record_error(&self, message: &str) {
        let breach_window = {
            let mut state = self.lock_state();
            let now = Utc::now();
            state.errors.push(ErrorRecord {
                message: message.to_string(),
                at: now,
            });

            let window = ChronoDuration::from_std(self.config.window)
                .unwrap_or_else(|_| ChronoDuration::seconds(60));
            let cutoff = now - window;
            state.errors.retain(|record| record.at >= cutoff);

            if state.errors.len() >= self.config.max_errors && !state.breached {
                state.breached = true;
                tracing::error!(
                    "boundary_breached: name={}, error_count={}",
                    self.name,
                    state.errors.len()
                );
                Some(state.errors.clone())
            } else {
                None
            }
        };

        if let Some(window_errors) = breach_window {
            if let Some(on_breach) = &self.on_breach {
                let on_breach = Arc::clone(on_breach);
                let result = catch_unwind(AssertUnwindSafe(|| on_breach(&window_errors)));
                if result.is_err() {
                    tracing::error!("breach_callback_panicked: name={}", self.name);
                }
            }
        }
    }

    /// Consult the recovery probe. A truthy probe clears the window, unlatches
    /// the boundary, and resets the attempt counter; anything else increments
    /// `recovery_attempts` and leaves the boundary breached.
    pub async fn attempt_recovery(&self) -> bool {
        let probe_result = match &self.recovery {
            Some(recovery) => recovery().await,
            // No probe configured: recovery is an explicit operator decision,
            // and calling this method is that decision.
            None => Ok(true),
        };

        let mut state = self.lock_state();
        match probe_result {
            Ok(true) => {
                state.errors.clear();
                state.breached = false;
                state.recovery_attempts = 0;
                tracing::info!("boundary_recovered: name={}", self.name);
                true
            }
            Ok(false) => {
                state.recovery_attempts += 1;
                tracing::warn!(
                    "boundary_recovery_rejected: name={}, attempts={}",
                    self.name,
                    state.recovery_attempts
                );
                false
            }
            Err(err) => {
                state.recovery_attempts += 1;
                tracing::warn!(
                    "boundary_recovery_failed: name={}, attempts={}, error={}",
                    self.name,
                    state.recovery_attempts,
                    err
                );
                false
            }
        }
    }

    /// Status snapshot.
    pub fn status(&self) -> BoundaryStatus {
        let state = self.lock_state();
        BoundaryStatus {
            name: self.name.clone(),
            breached: state.breached,
            error_count: state.errors.len(),
            recovery_attempts: state.recovery_attempts,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
