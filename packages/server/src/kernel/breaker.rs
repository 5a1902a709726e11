//! Per-dependency circuit breakers.
//!
//! Every downstream the pipeline calls (crawler, trainer) gets its own
//! breaker, looked up by name and created lazily on first use. State is
//! process-local and resets to closed on restart; the store never sees it.
//!
//! The registry is plain dependency-injected state carried in `ServerDeps`.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Consecutive failures that trip a closed breaker.
pub const FAILURE_THRESHOLD: u32 = 5;

/// How long an open breaker blocks calls before letting a probe through.
pub const TIMEOUT_WINDOW: Duration = Duration::from_secs(60);

/// Successes required in half-open before the breaker closes again.
pub const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Error)]
pub enum BreakerError {
    /// The breaker short-circuited the call; the operation was never invoked.
    #[error("circuit breaker '{name}' is open, retry in {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

/// Point-in-time view of one breaker, for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// What `before_call` decided about one call.
enum CallDecision {
    Allow,
    Deny { retry_after: Duration },
}

/// Registry of named circuit breakers.
///
/// Lookups go through a concurrent map; per-breaker transitions take that
/// entry's mutex, which is only ever held for the state update itself and
/// never across the guarded call.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Mutex<BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Run `operation` guarded by the named breaker.
    ///
    /// When the breaker is open the operation is not invoked and
    /// `BreakerError::Open` carries the remaining wait. Operation failures
    /// come back as `BreakerError::Inner` after the failure is recorded.
    pub async fn execute<T, F, Fut>(&self, name: &str, operation: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        match self.before_call(name, Utc::now()) {
            CallDecision::Deny { retry_after } => {
                debug!(breaker = name, ?retry_after, "call short-circuited");
                return Err(BreakerError::Open {
                    name: name.to_string(),
                    retry_after,
                });
            }
            CallDecision::Allow => {}
        }

        match operation().await {
            Ok(value) => {
                self.on_success(name);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(name, Utc::now());
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Like `execute`, but when the breaker blocks the call or the call
    /// fails, the fallback supplies the result instead.
    pub async fn execute_with_fallback<T, F, Fut, FB, FbFut>(
        &self,
        name: &str,
        operation: F,
        fallback: FB,
    ) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        FB: FnOnce() -> FbFut,
        FbFut: Future<Output = anyhow::Result<T>>,
    {
        match self.execute(name, operation).await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(breaker = name, error = %err, "falling back");
                fallback().await
            }
        }
    }

    /// Manually close the named breaker and zero its counters. Returns false
    /// if no breaker with that name exists yet.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(entry) => {
                let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
                *state = BreakerState::new();
                info!(breaker = name, "circuit breaker reset");
                true
            }
            None => false,
        }
    }

    /// Snapshot one breaker by name.
    pub fn service_health(&self, name: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(name).map(|entry| {
            let state = entry.lock().unwrap_or_else(|e| e.into_inner());
            BreakerSnapshot {
                name: name.to_string(),
                state: state.state,
                failure_count: state.failure_count,
                success_count: state.success_count,
                last_failure_time: state.last_failure_time,
            }
        })
    }

    /// Snapshot every breaker seen so far.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| {
                let state = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                BreakerSnapshot {
                    name: entry.key().clone(),
                    state: state.state,
                    failure_count: state.failure_count,
                    success_count: state.success_count,
                    last_failure_time: state.last_failure_time,
                }
            })
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Count of breakers currently open.
    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|entry| {
                let state = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                state.state == CircuitState::Open
            })
            .count()
    }

    fn before_call(&self, name: &str, now: DateTime<Utc>) -> CallDecision {
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(BreakerState::new()));
        let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => CallDecision::Allow,
            CircuitState::Open => {
                let elapsed = state
                    .last_failure_time
                    .map(|t| now.signed_duration_since(t))
                    .and_then(|d| d.to_std().ok())
                    .unwrap_or(Duration::ZERO);

                if elapsed >= TIMEOUT_WINDOW {
                    // Window elapsed: let probes through
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(breaker = name, "circuit breaker half-open");
                    CallDecision::Allow
                } else {
                    CallDecision::Deny {
                        retry_after: TIMEOUT_WINDOW - elapsed,
                    }
                }
            }
        }
    }

    fn on_success(&self, name: &str) {
        if let Some(entry) = self.breakers.get(name) {
            let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
            match state.state {
                CircuitState::Closed => {
                    state.failure_count = 0;
                }
                CircuitState::HalfOpen => {
                    state.success_count += 1;
                    if state.success_count >= HALF_OPEN_SUCCESS_THRESHOLD {
                        *state = BreakerState::new();
                        info!(breaker = name, "circuit breaker closed");
                    }
                }
                CircuitState::Open => {}
            }
        }
    }

    fn on_failure(&self, name: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.breakers.get(name) {
            let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
            state.failure_count += 1;
            state.last_failure_time = Some(now);

            match state.state {
                CircuitState::Closed => {
                    if state.failure_count >= FAILURE_THRESHOLD {
                        state.state = CircuitState::Open;
                        warn!(
                            breaker = name,
                            failures = state.failure_count,
                            "circuit breaker opened"
                        );
                    }
                }
                CircuitState::HalfOpen => {
                    // One failed probe reopens immediately
                    state.state = CircuitState::Open;
                    state.success_count = 0;
                    warn!(breaker = name, "circuit breaker reopened from half-open");
                }
                CircuitState::Open => {}
            }
        }
    }

    #[cfg(test)]
    fn force_state(&self, name: &str, new_state: BreakerState) {
        let entry = self
            .breakers
            .entry(name.to_string())
            .or_insert_with(|| Mutex::new(BreakerState::new()));
        let mut state = entry.lock().unwrap_or_else(|e| e.into_inner());
        *state = new_state;
    }
}
