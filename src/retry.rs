//! Backoff timing and transient-error classification.
//!
//! Both are pure: `BackoffPolicy::next_delay` maps a retry count to a delay,
//! and `classify` maps error text to `ErrorClass`. The retry loop in
//! `orchestrator::attempt` is the only caller that acts on either.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Exponential backoff with a retry cap.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Retries after the first attempt; total invocations are `max_retries + 1`.
    pub max_retries: u32,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_retries: 3,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_retries: config.max_retries,
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Same retry budget, no waiting. For tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows `retry_count` earlier retries:
    /// `base * multiplier^retry_count`, capped at `max_delay`.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    pub fn can_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

static TRANSIENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"rate[ _-]?limit",
        r"too many requests",
        r"\btime[ _-]?out\b",
        r"\btimed[ _-]?out\b",
        r"deadline exceeded",
        r"connection (?:reset|refused|aborted|closed|error)",
        r"\beconn(?:reset|refused|aborted)\b",
        r"broken pipe",
        r"network (?:error|unreachable)",
        r"temporar(?:y|ily) (?:unavailable|failure)",
        r"service unavailable",
        r"bad gateway",
        r"gateway time-?out",
        r"internal server error",
        r"\boverloaded\b",
        r"\b(?:http|status|error|code)[ :=]*(?:429|5\d\d)\b",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("transient pattern is valid"))
    .collect()
});

/// Classify error text. Anything outside the transient taxonomy is fatal.
pub fn classify(error: &str) -> ErrorClass {
    if TRANSIENT_PATTERNS.iter().any(|re| re.is_match(error)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Fatal
    }
}

/// Classify a raised error using its I/O kind when available, else its text.
pub fn classify_error(error: &anyhow::Error) -> ErrorClass {
    use std::io::ErrorKind;

    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>()
            && matches!(
                io.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::Interrupted
            )
        {
            return ErrorClass::Retryable;
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorClass::Retryable;
        }
    }
    classify(&format!("{:#}", error))
}
