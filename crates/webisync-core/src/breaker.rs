//! Circuit breaker for provider calls.
//!
//! One instance guards one named remote dependency. The state machine is
//! purely reactive: transitions are evaluated at the start of every call,
//! so no background task is needed.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Runtime circuit state for provider calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens.
    pub failure_threshold: u32,
    /// How long an open circuit rejects before allowing half-open trials.
    pub open_timeout: Duration,
    /// Trial calls admitted while half-open.
    pub half_open_max_requests: u32,
    /// Metrics reset wholesale once this much time passes without a failure.
    pub monitoring_period: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
            monitoring_period: Duration::from_secs(300),
        }
    }
}

/// Request counters accumulated across states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_requests: u64,
    pub consecutive_failures: u32,
    pub last_failure_at_ms: Option<i64>,
}

/// Observability snapshot returned by [`CircuitBreaker::status`].
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub metrics: CircuitBreakerMetrics,
    pub failure_rate: f64,
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open; the upstream call was never attempted.
    #[error("circuit '{name}' is open, request rejected")]
    Open { name: String },
    /// The upstream call ran and failed; the original error is preserved.
    #[error(transparent)]
    Upstream(E),
}

/// Handle returned by [`CircuitBreaker::on_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type StateListener = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    metrics: CircuitBreakerMetrics,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    half_open_trials: u32,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            metrics: CircuitBreakerMetrics::default(),
            opened_at: None,
            last_failure: None,
            half_open_trials: 0,
        }
    }
}

/// Thread-safe circuit breaker for one named remote dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: Mutex<Vec<(u64, StateListener)>>,
    next_listener_id: Mutex<u64>,
}

enum Admission {
    Allowed,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: Mutex::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker.
    ///
    /// When the circuit is open the upstream is never called and
    /// [`BreakerError::Open`] is returned immediately.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (admission, transition) = self.admit();
        self.notify(transition);

        if matches!(admission, Admission::Rejected) {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        match op().await {
            Ok(value) => {
                let transition = self.record_success();
                self.notify(transition);
                Ok(value)
            }
            Err(error) => {
                let transition = self.record_failure();
                self.notify(transition);
                Err(BreakerError::Upstream(error))
            }
        }
    }

    /// Like [`Self::execute`], but an open circuit routes to `fallback`
    /// instead of erroring. Upstream failures still propagate.
    pub async fn execute_or<T, E, F, Fut, FB>(&self, op: F, fallback: FB) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.execute(op).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open { .. }) => Ok(fallback()),
            Err(BreakerError::Upstream(error)) => Err(error),
        }
    }

    /// Evaluate lazy transitions and decide whether this call may pass.
    fn admit(&self) -> (Admission, Option<(CircuitState, CircuitState)>) {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        self.maybe_reset_metrics(&mut inner);

        match inner.state {
            CircuitState::Closed => {
                inner.metrics.total_requests += 1;
                (Admission::Allowed, None)
            }
            CircuitState::Open => {
                let can_probe = inner
                    .opened_at
                    .map(|opened_at| opened_at.elapsed() >= self.config.open_timeout)
                    .unwrap_or(false);

                if can_probe {
                    inner.state = CircuitState::HalfOpen;
                    inner.opened_at = None;
                    inner.half_open_trials = 1;
                    inner.metrics.total_requests += 1;
                    debug!(breaker = %self.name, "circuit half-open, admitting trial");
                    (
                        Admission::Allowed,
                        Some((CircuitState::Open, CircuitState::HalfOpen)),
                    )
                } else {
                    (Admission::Rejected, None)
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_trials < self.config.half_open_max_requests {
                    inner.half_open_trials += 1;
                    inner.metrics.total_requests += 1;
                    (Admission::Allowed, None)
                } else {
                    (Admission::Rejected, None)
                }
            }
        }
    }

    fn record_success(&self) -> Option<(CircuitState, CircuitState)> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        inner.metrics.success_requests += 1;
        inner.metrics.consecutive_failures = 0;

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.half_open_trials = 0;
            inner.opened_at = None;
            debug!(breaker = %self.name, "trial succeeded, circuit closed");
            return Some((CircuitState::HalfOpen, CircuitState::Closed));
        }
        None
    }

    fn record_failure(&self) -> Option<(CircuitState, CircuitState)> {
        let mut inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        inner.metrics.failed_requests += 1;
        inner.metrics.consecutive_failures = inner.metrics.consecutive_failures.saturating_add(1);
        inner.metrics.last_failure_at_ms = Some(now_ms());
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_trials = 0;
                warn!(breaker = %self.name, "trial failed, circuit re-opened");
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            CircuitState::Closed
                if inner.metrics.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    consecutive_failures = inner.metrics.consecutive_failures,
                    "failure threshold reached, circuit opened"
                );
                Some((CircuitState::Closed, CircuitState::Open))
            }
            _ => None,
        }
    }

    /// Counters reset wholesale once `monitoring_period` passes without a
    /// failure, independent of state transitions.
    fn maybe_reset_metrics(&self, inner: &mut BreakerInner) {
        let expired = inner
            .last_failure
            .map(|at| at.elapsed() >= self.config.monitoring_period)
            .unwrap_or(false);

        if expired {
            inner.metrics = CircuitBreakerMetrics::default();
            inner.last_failure = None;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock is not poisoned")
            .state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self
            .inner
            .lock()
            .expect("circuit breaker lock is not poisoned");

        let failure_rate = if inner.metrics.total_requests == 0 {
            0.0
        } else {
            inner.metrics.failed_requests as f64 / inner.metrics.total_requests as f64
        };

        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            metrics: inner.metrics,
            failure_rate,
        }
    }

    /// Restore `Closed` and zero all counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self
                .inner
                .lock()
                .expect("circuit breaker lock is not poisoned");
            let previous = inner.state;
            *inner = BreakerInner::default();
            (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
        };
        self.notify(transition);
    }

    /// Register a synchronous state-change listener.
    pub fn on_state_change<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        let mut next_id = self
            .next_listener_id
            .lock()
            .expect("listener id lock is not poisoned");
        let id = *next_id;
        *next_id += 1;

        self.listeners
            .lock()
            .expect("listener lock is not poisoned")
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.listeners
            .lock()
            .expect("listener lock is not poisoned")
            .retain(|(id, _)| *id != subscription.0);
    }

    /// Listener panics must not break the breaker's control flow.
    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };

        let listeners: Vec<StateListener> = {
            let guard = self.listeners.lock().expect("listener lock is not poisoned");
            guard.iter().map(|(_, listener)| Arc::clone(listener)).collect()
        };

        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| (*listener)(from, to))).is_err() {
                warn!(breaker = %self.name, "state-change listener panicked");
            }
        }
    }
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Explicit per-dependency breaker cache.
///
/// Owned by the orchestrator and passed by reference; one breaker per
/// named remote dependency, created on first use.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for a dependency name.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        Arc::clone(
            breakers
                .entry(name.to_owned())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config))),
        )
    }

    pub fn names(&self) -> Vec<String> {
        let breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        let mut names: Vec<String> = breakers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reset_all(&self) {
        let breakers = self
            .breakers
            .lock()
            .expect("breaker registry lock is not poisoned");
        for breaker in breakers.values() {
            breaker.reset();
        }
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
