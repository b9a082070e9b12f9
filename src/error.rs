//! Error handling for the ipintel scanner
//!
//! Per-target failures are captured into results and never reach this
//! type's callers; what remains here is client-input rejection, job-fatal
//! conditions, and the errors enrichment adapters hand back to the worker.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Main error type for scanning operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Target list is empty")]
    EmptyBatch,

    #[error("Failed to resolve {target}: {reason}")]
    Resolution { target: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Enrichment error: {0}")]
    Enrichment(String),

    #[error("AI summary unavailable: {0}")]
    Summarizer(#[from] SummarizerError),

    #[error("External tool error: {0}")]
    Tool(String),

    #[error("Job store error: {0}")]
    Store(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ScanError {
    /// Whether the error came from bad client input rather than the system
    pub fn is_client_error(&self) -> bool {
        matches!(self, ScanError::InvalidTarget(_) | ScanError::EmptyBatch)
    }
}

/// Failure modes of the AI risk summary path
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SummarizerError {
    #[error("API credentials not configured")]
    MissingCredentials,

    #[error("rate limited by provider")]
    RateLimited,

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("circuit open, skipping call")]
    CircuitOpen,
}

/// Result type alias for scan operations
pub type ScanResult<T> = Result<T, ScanError>;

/// Capped exponential backoff for operations that must not be dropped
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt.min(10) as u32));
        Duration::from_millis(exponential.min(self.max_delay_ms))
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

/// Circuit breaker protecting a flaky upstream (the AI provider) from
/// being hammered while it is rate limiting us.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, success_threshold: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
            })),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            success_threshold: success_threshold.max(1),
        }
    }

    /// Check if the breaker lets a call through, moving Open -> HalfOpen
    /// once the recovery timeout has elapsed.
    pub async fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => return true,
                CircuitBreakerState::Open => {
                    let expired = inner
                        .opened_at
                        .map(|t| t.elapsed() >= self.recovery_timeout)
                        .unwrap_or(true);
                    if !expired {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        if inner.state == CircuitBreakerState::Open {
            inner.state = CircuitBreakerState::HalfOpen;
            inner.half_open_successes = 0;
        }
        true
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    inner.state = CircuitBreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            CircuitBreakerState::Closed => inner.consecutive_failures = 0,
            CircuitBreakerState::Open => {}
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        inner.consecutive_failures += 1;
        let trip = inner.state == CircuitBreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitBreakerState::Open {
            log::warn!(
                "Circuit breaker opened after {} consecutive failures",
                inner.consecutive_failures
            );
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.half_open_successes = 0;
        }
    }

    /// Get current circuit breaker state
    pub async fn get_state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let policy = RetryPolicy::new(5, 100);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(50), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn breaker_trips_and_recovers() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20), 1);
        assert!(breaker.can_execute().await);

        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitBreakerState::Closed);
        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitBreakerState::Open);
        assert!(!breaker.can_execute().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breaker.can_execute().await);
        assert_eq!(breaker.get_state().await, CircuitBreakerState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.get_state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(10), 2);
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(breaker.can_execute().await);
        breaker.record_failure().await;
        assert_eq!(breaker.get_state().await, CircuitBreakerState::Open);
    }

    #[test]
    fn client_errors_are_flagged() {
        assert!(ScanError::EmptyBatch.is_client_error());
        assert!(ScanError::InvalidTarget("x y".into()).is_client_error());
        assert!(!ScanError::Store("disk full".into()).is_client_error());
    }
}
