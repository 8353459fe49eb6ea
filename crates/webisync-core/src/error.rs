use thiserror::Error;

/// Configuration validation errors raised by component constructors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrency must be greater than zero")]
    ZeroConcurrency,
    #[error("daily_limit must be greater than zero")]
    ZeroDailyLimit,
    #[error("pacing_limit must be greater than zero")]
    ZeroPacingLimit,
    #[error("pacing_window must be greater than zero")]
    ZeroPacingWindow,
    #[error("idle_poll must be greater than zero")]
    ZeroIdlePoll,
}
