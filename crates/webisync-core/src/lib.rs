//! Core sync resilience engine for webisync.
//!
//! This crate contains the non-trivial coordination logic for syncing
//! large paginated datasets out of a rate-limited, occasionally
//! unreliable webinar-provider API:
//!
//! - **Error classification** with fixed per-category retry policies
//! - **Rate limiting** and a priority-ordered outbound request queue
//! - **Circuit breaking** around named remote dependencies
//! - **Sync mode decisions** (full vs delta vs skip) from history and volume
//! - **Job health monitoring** with phantom/stalled detection and
//!   forced recovery
//!
//! The surrounding application (orchestration, persistence, UI) stays
//! outside: it supplies call executors, a [`JobStore`], and an optional
//! [`ProgressProbe`], and consumes the status snapshots exposed here.
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`breaker`] | Circuit breaker state machine and per-dependency registry |
//! | [`classify`] | Failure classification and retry delay math |
//! | [`decision`] | Sync mode decision engine and performance reporting |
//! | [`error`] | Configuration validation errors |
//! | [`job`] | Persisted-job contracts and collaborator traits |
//! | [`limiter`] | Rate limiter and priority request queue |
//! | [`monitor`] | Health monitor: diagnostics plus heartbeat loop |

pub mod breaker;
pub mod classify;
pub mod decision;
pub mod error;
pub mod job;
pub mod limiter;
pub mod monitor;

pub use breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitBreakerRegistry, CircuitBreakerStatus, CircuitState, SubscriptionId,
};
pub use classify::{
    classify, CallFailure, ClassifiedError, ErrorCategory, QuotaHints, RetryPolicy, RetryStrategy,
};
pub use decision::{
    analyze_performance, decide, decide_at, PerformanceReport, SyncDecision, SyncHistory, SyncMode,
    SyncRunSummary, WorkloadMetrics,
};
pub use error::ConfigError;
pub use job::{
    BoxFuture, CancelOutcome, ExternalProgress, ExternalStatus, JobStatus, JobStore, ProbeError,
    ProgressProbe, StoreError, SyncJobRecord,
};
pub use limiter::{
    CallReport, ProviderRateLimiter, QueueDepth, RateLimitStatus, RateLimiterConfig, RequestError,
};
pub use monitor::{
    validate_consistency, ConsistencyReport, HealthMonitor, HealthMonitorConfig, RecoverError,
    Severity, StallReport,
};
