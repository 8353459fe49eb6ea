//! Failure classification and retry policy for provider calls.
//!
//! Every failure observed by the engine is mapped once into a
//! [`ClassifiedError`] carrying a fixed per-category retry policy. The
//! classifier prefers the structured HTTP status when the caller supplied
//! one and falls back to message-pattern matching otherwise.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry delays never exceed this cap, regardless of strategy.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Canonical failure categories for provider calls.
///
/// Immutable once assigned; every other component consumes these values
/// and none redefines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Network,
    Authentication,
    ApiError,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::Authentication => "authentication",
            Self::ApiError => "api_error",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }

    /// Fixed retry policy attached to this category.
    pub const fn policy(self) -> RetryPolicy {
        match self {
            Self::RateLimit => RetryPolicy {
                retryable: true,
                strategy: RetryStrategy::Exponential,
                max_retries: 5,
                base_delay: Duration::from_secs(60),
            },
            Self::Network => RetryPolicy {
                retryable: true,
                strategy: RetryStrategy::Exponential,
                max_retries: 3,
                base_delay: Duration::from_secs(5),
            },
            Self::Authentication => RetryPolicy {
                retryable: false,
                strategy: RetryStrategy::None,
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
            Self::ApiError => RetryPolicy {
                retryable: true,
                strategy: RetryStrategy::Linear,
                max_retries: 2,
                base_delay: Duration::from_secs(10),
            },
            Self::Timeout => RetryPolicy {
                retryable: true,
                strategy: RetryStrategy::Linear,
                max_retries: 3,
                base_delay: Duration::from_secs(15),
            },
            Self::Validation => RetryPolicy {
                retryable: false,
                strategy: RetryStrategy::None,
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
            Self::Unknown => RetryPolicy {
                retryable: true,
                strategy: RetryStrategy::Exponential,
                max_retries: 2,
                base_delay: Duration::from_secs(5),
            },
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff shape applied between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    None,
    Immediate,
    Linear,
    Exponential,
}

/// Per-category retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retryable: bool,
    pub strategy: RetryStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
}

/// Provider quota values parsed from response headers.
///
/// Header-reported values are authoritative when present; the limiter's
/// local decrement is only a fallback estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QuotaHints {
    pub remaining: Option<u32>,
    pub limit: Option<u32>,
    pub reset_at_ms: Option<i64>,
}

impl QuotaHints {
    pub const fn is_empty(self) -> bool {
        self.remaining.is_none() && self.limit.is_none() && self.reset_at_ms.is_none()
    }
}

/// Opaque failure envelope returned by a call executor.
///
/// The engine never inspects request payloads; a failure is a message plus
/// optional structured hints the transport layer was able to extract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFailure {
    message: String,
    status: Option<u16>,
    retry_after: Option<Duration>,
}

impl CallFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// Provider-supplied pause hint, e.g. a `Retry-After` header.
    pub const fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

impl Display for CallFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for CallFailure {}

/// A failure mapped to its category and retry policy.
///
/// Created once per failure, consumed by retry logic, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    pub strategy: RetryStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub status: Option<u16>,
}

impl ClassifiedError {
    /// Whether another attempt is allowed after `attempt` completed tries.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        self.retryable && attempt < self.max_retries
    }

    /// Delay before retry attempt number `attempt` (1-based).
    ///
    /// Linear grows as `base * attempt`; exponential doubles from `base`
    /// and is capped at five minutes.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            RetryStrategy::None | RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let scale = 2u32.checked_pow(attempt - 1);
                let delay = scale
                    .and_then(|scale| self.base_delay.checked_mul(scale))
                    .unwrap_or(MAX_RETRY_DELAY);
                delay.min(MAX_RETRY_DELAY)
            }
        }
    }

    /// [`Self::retry_delay`] with +/- 50% jitter, for schedulers that want
    /// to decorrelate replays after a shared pause.
    pub fn jittered_retry_delay(&self, attempt: u32) -> Duration {
        let delay = self.retry_delay(attempt);
        if delay.is_zero() {
            return delay;
        }

        let half = delay.as_millis() as u64 / 2;
        let offset = fastrand::u64(0..=half * 2);
        Duration::from_millis(delay.as_millis() as u64 - half + offset)
    }
}

impl Display for ClassifiedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "too many requests",
    "quota exceeded",
    "throttl",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "authentication",
    "invalid token",
    "token expired",
    "forbidden",
    "api key",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out", "deadline exceeded"];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection",
    "econnrefused",
    "econnreset",
    "dns",
    "socket",
    "unreachable",
    "broken pipe",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "validation",
    "invalid parameter",
    "missing required",
    "malformed",
];

/// Map a provider-call failure into its category and retry policy.
///
/// Pure and deterministic: no I/O, no clock, no mutation. Structured
/// status codes win over free-text patterns; message matching is the
/// fallback for transports that could not surface a status.
pub fn classify(failure: &CallFailure) -> ClassifiedError {
    let message = failure.message().to_ascii_lowercase();
    let status = failure.status();

    let category = if status == Some(429) || matches_any(&message, RATE_LIMIT_PATTERNS) {
        ErrorCategory::RateLimit
    } else if matches!(status, Some(401) | Some(403)) || matches_any(&message, AUTH_PATTERNS) {
        ErrorCategory::Authentication
    } else if status == Some(408) || matches_any(&message, TIMEOUT_PATTERNS) {
        ErrorCategory::Timeout
    } else if matches_any(&message, NETWORK_PATTERNS) {
        ErrorCategory::Network
    } else if status == Some(422) {
        ErrorCategory::Validation
    } else if matches!(status, Some(code) if (400..600).contains(&code)) {
        ErrorCategory::ApiError
    } else if matches_any(&message, VALIDATION_PATTERNS) {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    };

    let policy = category.policy();
    ClassifiedError {
        category,
        message: failure.message().to_owned(),
        retryable: policy.retryable,
        strategy: policy.strategy,
        max_retries: policy.max_retries,
        base_delay: policy.base_delay,
        status,
    }
}

fn matches_any(message: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| message.contains(pattern))
}
