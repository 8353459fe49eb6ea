//! Provider rate limiter and priority request queue.
//!
//! Outbound provider calls are enqueued with a priority and dispatched by
//! a single scheduling loop that respects three gates: a concurrency cap,
//! a short-window pacing quota (token bucket), and the provider's daily
//! quota. Header-reported quota values are authoritative when a call
//! surfaces them; the local decrement is only a fallback estimator.
//!
//! The limiter owns exactly one retry concern: replaying a dispatch that
//! the provider rejected with a rate-limit error. Every other failure
//! propagates to the caller untouched, so retry counting lives in one
//! layer only.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::classify::{classify, CallFailure, ErrorCategory, QuotaHints};
use crate::error::ConfigError;
use crate::job::BoxFuture;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const DAY_MS: i64 = 86_400_000;
/// Re-check delay while the pacing bucket is empty.
const PACING_RETRY: Duration = Duration::from_millis(200);

/// Limiter thresholds and windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Concurrently dispatched requests.
    pub max_concurrency: usize,
    /// Provider daily quota, the fallback estimate when headers are absent.
    pub daily_limit: u32,
    /// Short pacing window for the token bucket.
    pub pacing_window: Duration,
    /// Requests admitted per pacing window.
    pub pacing_limit: u32,
    /// Upper bound between scheduler wake-ups while idle or paused.
    pub idle_poll: Duration,
    /// Pause length after a provider rate-limit error without a
    /// retry-after hint.
    pub limited_fallback_reset: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            daily_limit: 10_000,
            pacing_window: Duration::from_secs(60),
            pacing_limit: 60,
            idle_poll: Duration::from_secs(60),
            limited_fallback_reset: Duration::from_secs(3_600),
        }
    }
}

impl RateLimiterConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.daily_limit == 0 {
            return Err(ConfigError::ZeroDailyLimit);
        }
        if self.pacing_limit == 0 {
            return Err(ConfigError::ZeroPacingLimit);
        }
        if self.pacing_window.is_zero() {
            return Err(ConfigError::ZeroPacingWindow);
        }
        if self.idle_poll.is_zero() {
            return Err(ConfigError::ZeroIdlePoll);
        }
        Ok(())
    }
}

/// Quota snapshot returned by [`ProviderRateLimiter::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub daily_limit: u32,
    pub current_usage: u32,
    pub reset_at_ms: i64,
    pub is_limited: bool,
}

/// Queue occupancy returned by [`ProviderRateLimiter::queue_depth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub queued: usize,
    pub active: usize,
}

/// Terminal error for an enqueued request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request queue cleared before dispatch")]
    QueueCleared,
    #[error("rate limiter shut down before the request completed")]
    Shutdown,
    /// The provider call failed with a non-rate-limit error; the caller
    /// applies its own classified retry policy.
    #[error(transparent)]
    Call(CallFailure),
}

/// Successful provider call plus any quota headers the transport parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReport<T> {
    pub value: T,
    pub quota: Option<QuotaHints>,
}

impl<T> CallReport<T> {
    pub fn new(value: T) -> Self {
        Self { value, quota: None }
    }

    pub fn with_quota(mut self, quota: QuotaHints) -> Self {
        self.quota = Some(quota);
        self
    }
}

enum Disposition {
    Completed { quota: Option<QuotaHints> },
    RateLimited { retry_after: Option<Duration> },
    Failed,
}

struct QueuedRequest {
    id: Uuid,
    priority: u8,
    run: Box<dyn Fn() -> BoxFuture<'static, Disposition> + Send + Sync>,
    reject: Box<dyn Fn(RequestError) + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
struct QuotaState {
    remaining: u32,
    daily_limit: u32,
    current_usage: u32,
    reset_at_ms: i64,
    limited: bool,
}

impl QuotaState {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            remaining: config.daily_limit,
            daily_limit: config.daily_limit,
            current_usage: 0,
            reset_at_ms: now_ms() + DAY_MS,
            limited: false,
        }
    }

    /// Refill once the reset instant has passed.
    fn maybe_refill(&mut self, now: i64) {
        if now >= self.reset_at_ms {
            self.remaining = self.daily_limit;
            self.current_usage = 0;
            self.limited = false;
            self.reset_at_ms = now + DAY_MS;
        }
    }

    /// Header-reported values overwrite the local estimate.
    fn apply_hints(&mut self, hints: Option<QuotaHints>) {
        let Some(hints) = hints else {
            return;
        };
        if let Some(limit) = hints.limit {
            self.daily_limit = limit;
        }
        if let Some(remaining) = hints.remaining {
            self.remaining = remaining;
            self.limited = remaining == 0;
        }
        if let Some(reset_at_ms) = hints.reset_at_ms {
            self.reset_at_ms = reset_at_ms;
        }
    }
}

struct QueueState {
    pending: BTreeMap<u8, VecDeque<QueuedRequest>>,
    active: usize,
    quota: QuotaState,
}

impl QueueState {
    fn new(config: &RateLimiterConfig) -> Self {
        Self {
            pending: BTreeMap::new(),
            active: 0,
            quota: QuotaState::new(config),
        }
    }

    fn queued_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    fn push_back(&mut self, request: QueuedRequest) {
        self.pending
            .entry(request.priority)
            .or_default()
            .push_back(request);
    }

    /// Re-insert a rate-limited request at the head of its priority band.
    fn push_front(&mut self, request: QueuedRequest) {
        self.pending
            .entry(request.priority)
            .or_default()
            .push_front(request);
    }

    fn pop_next(&mut self) -> Option<QueuedRequest> {
        let (&priority, _) = self.pending.iter().next()?;
        let band = self.pending.get_mut(&priority)?;
        let request = band.pop_front();
        if band.is_empty() {
            self.pending.remove(&priority);
        }
        request
    }

    fn drain_pending(&mut self) -> Vec<QueuedRequest> {
        let mut drained = Vec::with_capacity(self.queued_len());
        for (_, mut band) in std::mem::take(&mut self.pending) {
            drained.extend(band.drain(..));
        }
        drained
    }
}

/// Priority queue gating outbound provider calls behind the provider's
/// rate limits.
///
/// Requests dispatch in ascending priority order, FIFO within a band.
/// `clear` rejects everything pending; in-flight dispatches always run to
/// completion.
pub struct ProviderRateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    scheduler: JoinHandle<()>,
}

impl ProviderRateLimiter {
    /// Create the limiter and spawn its scheduling loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RateLimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let pacing = Arc::new(RateLimiter::direct(quota_from_window(
            config.pacing_window,
            config.pacing_limit,
        )));
        let state = Arc::new(Mutex::new(QueueState::new(&config)));
        let notify = Arc::new(Notify::new());

        let scheduler = tokio::spawn(run_scheduler(
            Arc::clone(&state),
            pacing,
            Arc::clone(&notify),
            config.clone(),
        ));

        Ok(Self {
            config,
            state,
            notify,
            scheduler,
        })
    }

    /// Queue a provider call and await its outcome.
    ///
    /// `op` is called once per dispatch; it may run again only when the
    /// provider rejected the previous dispatch with a rate-limit error.
    pub async fn enqueue<T, F, Fut>(&self, priority: u8, op: F) -> Result<T, RequestError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallReport<T>, CallFailure>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, RequestError>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let op = Arc::new(op);

        let run_slot = Arc::clone(&slot);
        let run = Box::new(move || -> BoxFuture<'static, Disposition> {
            let op = Arc::clone(&op);
            let slot = Arc::clone(&run_slot);
            Box::pin(async move {
                match (*op)().await {
                    Ok(report) => {
                        if let Some(tx) =
                            slot.lock().expect("result slot lock is not poisoned").take()
                        {
                            let _ = tx.send(Ok(report.value));
                        }
                        Disposition::Completed {
                            quota: report.quota,
                        }
                    }
                    Err(failure) => {
                        if classify(&failure).category == ErrorCategory::RateLimit {
                            Disposition::RateLimited {
                                retry_after: failure.retry_after(),
                            }
                        } else {
                            if let Some(tx) =
                                slot.lock().expect("result slot lock is not poisoned").take()
                            {
                                let _ = tx.send(Err(RequestError::Call(failure)));
                            }
                            Disposition::Failed
                        }
                    }
                }
            })
        });

        let reject_slot = Arc::clone(&slot);
        let reject = Box::new(move |error: RequestError| {
            if let Some(tx) = reject_slot
                .lock()
                .expect("result slot lock is not poisoned")
                .take()
            {
                let _ = tx.send(Err(error));
            }
        });

        {
            let mut state = self.state.lock().expect("limiter state lock is not poisoned");
            state.push_back(QueuedRequest {
                id: Uuid::new_v4(),
                priority,
                run,
                reject,
            });
        }
        self.notify.notify_one();

        rx.await.unwrap_or(Err(RequestError::Shutdown))
    }

    pub fn status(&self) -> RateLimitStatus {
        let mut state = self.state.lock().expect("limiter state lock is not poisoned");
        state.quota.maybe_refill(now_ms());
        let quota = state.quota;
        RateLimitStatus {
            remaining: quota.remaining,
            daily_limit: quota.daily_limit,
            current_usage: quota.current_usage,
            reset_at_ms: quota.reset_at_ms,
            is_limited: quota.limited || quota.remaining == 0,
        }
    }

    pub fn queue_depth(&self) -> QueueDepth {
        let state = self.state.lock().expect("limiter state lock is not poisoned");
        QueueDepth {
            queued: state.queued_len(),
            active: state.active,
        }
    }

    /// Reject every pending request with [`RequestError::QueueCleared`].
    ///
    /// Already-dispatched calls are unaffected and run to completion.
    pub fn clear(&self) {
        let drained = {
            let mut state = self.state.lock().expect("limiter state lock is not poisoned");
            state.drain_pending()
        };

        let rejected = drained.len();
        for request in drained {
            (request.reject)(RequestError::QueueCleared);
        }
        if rejected > 0 {
            debug!(rejected, "request queue cleared");
        }
        self.notify.notify_one();
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

impl Drop for ProviderRateLimiter {
    fn drop(&mut self) {
        self.scheduler.abort();
        if let Ok(mut state) = self.state.lock() {
            let drained = state.drain_pending();
            drop(state);
            for request in drained {
                (request.reject)(RequestError::Shutdown);
            }
        }
    }
}

async fn run_scheduler(
    state: Arc<Mutex<QueueState>>,
    pacing: Arc<DirectRateLimiter>,
    notify: Arc<Notify>,
    config: RateLimiterConfig,
) {
    loop {
        let wait = pump(&state, &pacing, &notify, &config);
        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

/// Dispatch as much pending work as the three gates allow and return how
/// long the scheduler may sleep before re-checking.
fn pump(
    state: &Arc<Mutex<QueueState>>,
    pacing: &Arc<DirectRateLimiter>,
    notify: &Arc<Notify>,
    config: &RateLimiterConfig,
) -> Duration {
    loop {
        let request = {
            let mut guard = state.lock().expect("limiter state lock is not poisoned");
            let now = now_ms();
            guard.quota.maybe_refill(now);

            if guard.quota.limited {
                let until_reset = (guard.quota.reset_at_ms - now).max(50) as u64;
                return Duration::from_millis(until_reset).min(config.idle_poll);
            }
            if guard.active >= config.max_concurrency || guard.queued_len() == 0 {
                return config.idle_poll;
            }
            if guard.quota.remaining == 0 {
                guard.quota.limited = true;
                warn!(reset_at_ms = guard.quota.reset_at_ms, "daily quota exhausted, pausing dispatch");
                continue;
            }
            if pacing.check().is_err() {
                return PACING_RETRY;
            }

            let request = guard.pop_next().expect("queue is non-empty inside the lock");
            guard.active += 1;
            guard.quota.remaining = guard.quota.remaining.saturating_sub(1);
            guard.quota.current_usage += 1;
            request
        };

        dispatch(request, Arc::clone(state), Arc::clone(notify), config);
    }
}

fn dispatch(
    request: QueuedRequest,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    config: &RateLimiterConfig,
) {
    let fallback_reset = config.limited_fallback_reset;
    debug!(request = %request.id, priority = request.priority, "dispatching provider call");

    tokio::spawn(async move {
        let disposition = (request.run)().await;
        {
            let mut guard = state.lock().expect("limiter state lock is not poisoned");
            guard.active -= 1;
            match disposition {
                Disposition::Completed { quota } => guard.quota.apply_hints(quota),
                Disposition::RateLimited { retry_after } => {
                    let pause = retry_after.unwrap_or(fallback_reset);
                    guard.quota.limited = true;
                    guard.quota.remaining = 0;
                    guard.quota.reset_at_ms = now_ms() + pause.as_millis() as i64;
                    warn!(
                        request = %request.id,
                        pause_ms = pause.as_millis() as u64,
                        "provider rate limit hit, replaying after reset"
                    );
                    guard.push_front(request);
                }
                Disposition::Failed => {}
            }
        }
        notify.notify_one();
    });
}

fn quota_from_window(window: Duration, limit: u32) -> Quota {
    let safe_limit = limit.max(1);
    let burst = NonZeroU32::new(safe_limit).expect("safe limit must be non-zero");

    let seconds_per_cell = (window.as_secs_f64() / f64::from(safe_limit)).max(0.001);
    let period = Duration::from_secs_f64(seconds_per_cell);

    Quota::with_period(period)
        .expect("period is always greater than zero")
        .allow_burst(burst)
}

fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RateLimiterConfig {
        RateLimiterConfig {
            max_concurrency: 5,
            daily_limit: 100,
            pacing_window: Duration::from_secs(1),
            pacing_limit: 1_000,
            idle_poll: Duration::from_secs(60),
            limited_fallback_reset: Duration::from_secs(3_600),
        }
    }

    #[test]
    fn config_rejects_zero_caps() {
        let config = RateLimiterConfig {
            max_concurrency: 0,
            ..fast_config()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn completed_request_returns_value_and_tracks_usage() {
        let limiter = ProviderRateLimiter::new(fast_config()).expect("limiter");

        let value = limiter
            .enqueue(5, || async { Ok(CallReport::new(41)) })
            .await
            .expect("request completes");
        assert_eq!(value, 41);

        let status = limiter.status();
        assert_eq!(status.current_usage, 1);
        assert_eq!(status.remaining, 99);
        assert!(!status.is_limited);
    }

    #[tokio::test]
    async fn requests_dispatch_in_priority_order() {
        let limiter = Arc::new(
            ProviderRateLimiter::new(RateLimiterConfig {
                max_concurrency: 1,
                ..fast_config()
            })
            .expect("limiter"),
        );

        let gate = Arc::new(Notify::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let blocker_gate = Arc::clone(&gate);
        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .enqueue(0, move || {
                        let gate = Arc::clone(&blocker_gate);
                        async move {
                            gate.notified().await;
                            Ok(CallReport::new(0u8))
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        for priority in [3u8, 1, 2] {
            let limiter = Arc::clone(&limiter);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                limiter
                    .enqueue(priority, move || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().expect("test lock").push(priority);
                            Ok(CallReport::new(priority))
                        }
                    })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        gate.notify_one();
        blocker.await.expect("join").expect("blocker completes");
        for handle in handles {
            handle.await.expect("join").expect("request completes");
        }

        assert_eq!(order.lock().expect("test lock").as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn clear_rejects_pending_but_not_in_flight() {
        let limiter = Arc::new(
            ProviderRateLimiter::new(RateLimiterConfig {
                max_concurrency: 1,
                ..fast_config()
            })
            .expect("limiter"),
        );

        let gate = Arc::new(Notify::new());
        let blocker_gate = Arc::clone(&gate);
        let blocker = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .enqueue(0, move || {
                        let gate = Arc::clone(&blocker_gate);
                        async move {
                            gate.notified().await;
                            Ok(CallReport::new(7u8))
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut pending = Vec::new();
        for priority in [1u8, 2, 3] {
            let limiter = Arc::clone(&limiter);
            pending.push(tokio::spawn(async move {
                limiter
                    .enqueue(priority, || async { Ok(CallReport::new(0u8)) })
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.queue_depth().queued, 3);

        limiter.clear();
        for handle in pending {
            let result = handle.await.expect("join");
            assert_eq!(result, Err(RequestError::QueueCleared));
        }
        assert_eq!(limiter.queue_depth().active, 1);

        gate.notify_one();
        assert_eq!(blocker.await.expect("join"), Ok(7));
    }

    #[tokio::test]
    async fn rate_limited_dispatch_pauses_then_replays() {
        let limiter = Arc::new(ProviderRateLimiter::new(fast_config()).expect("limiter"));

        let attempts = Arc::new(AtomicU32::new(0));
        let op_attempts = Arc::clone(&attempts);
        let handle = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .enqueue(1, move || {
                        let attempts = Arc::clone(&op_attempts);
                        async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(CallFailure::new("rate limit exceeded")
                                    .with_status(429)
                                    .with_retry_after(Duration::from_millis(80)))
                            } else {
                                Ok(CallReport::new(9u8))
                            }
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = limiter.status();
        assert!(status.is_limited);
        assert!(status.reset_at_ms > now_ms());
        assert_eq!(limiter.queue_depth().queued, 1);

        assert_eq!(handle.await.expect("join"), Ok(9));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_rate_limit_failures_propagate_without_replay() {
        let limiter = ProviderRateLimiter::new(fast_config()).expect("limiter");

        let attempts = Arc::new(AtomicU32::new(0));
        let op_attempts = Arc::clone(&attempts);
        let result: Result<u8, RequestError> = limiter
            .enqueue(1, move || {
                let attempts = Arc::clone(&op_attempts);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CallFailure::new("internal server error").with_status(500))
                }
            })
            .await;

        match result {
            Err(RequestError::Call(failure)) => assert_eq!(failure.status(), Some(500)),
            other => panic!("expected call failure, got {other:?}"),
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn header_quota_hints_overwrite_local_estimate() {
        let limiter = ProviderRateLimiter::new(fast_config()).expect("limiter");

        limiter
            .enqueue(1, || async {
                Ok(CallReport::new(()).with_quota(QuotaHints {
                    remaining: Some(7),
                    limit: Some(50),
                    reset_at_ms: Some(now_ms() + 120_000),
                }))
            })
            .await
            .expect("request completes");

        let status = limiter.status();
        assert_eq!(status.remaining, 7);
        assert_eq!(status.daily_limit, 50);
        assert!(!status.is_limited);
    }

    #[tokio::test]
    async fn exhausted_daily_quota_pauses_dispatch() {
        let limiter = Arc::new(
            ProviderRateLimiter::new(RateLimiterConfig {
                daily_limit: 2,
                ..fast_config()
            })
            .expect("limiter"),
        );

        for _ in 0..2 {
            limiter
                .enqueue(1, || async { Ok(CallReport::new(())) })
                .await
                .expect("request completes");
        }

        let status = limiter.status();
        assert_eq!(status.remaining, 0);
        assert!(status.is_limited);

        let stuck = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move {
                limiter
                    .enqueue(1, || async { Ok(CallReport::new(())) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stuck.is_finished());
        assert_eq!(limiter.queue_depth().queued, 1);
        stuck.abort();
    }
}
