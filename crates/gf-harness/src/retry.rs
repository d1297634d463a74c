//! Bounded retries with pluggable backoff schedules.
//!
//! The controller consults the classifier for transience and the circuit
//! breaker before every attempt, and reports the attempt outcome back to the
//! breaker afterwards. Rate-limited failures override the schedule with a
//! fixed long delay.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::classifier::{classify, AgentError, Classified, FailureKind};

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffSchedule {
    #[default]
    Exponential,
    Linear,
    Fibonacci,
}

impl BackoffSchedule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exponential" => Some(BackoffSchedule::Exponential),
            "linear" => Some(BackoffSchedule::Linear),
            "fibonacci" => Some(BackoffSchedule::Fibonacci),
            _ => None,
        }
    }

    /// Multiplier applied to the base delay after `attempt` failures
    /// (1-based).
    fn factor(&self, attempt: u32) -> u64 {
        let n = attempt.max(1);
        match self {
            BackoffSchedule::Exponential => 1u64 << (n - 1).min(16),
            BackoffSchedule::Linear => n as u64,
            BackoffSchedule::Fibonacci => {
                let (mut a, mut b) = (1u64, 1u64);
                for _ in 1..n {
                    let next = a.saturating_add(b);
                    a = b;
                    b = next;
                }
                a
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Fixed delay applied to rate-limited failures regardless of schedule.
pub const RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub schedule: BackoffSchedule,
    /// ±20% randomization on computed delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            schedule: BackoffSchedule::Exponential,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep after the `attempt`-th failure (1-based) of the given
    /// kind.
    pub fn delay_for(&self, attempt: u32, kind: FailureKind) -> Duration {
        if kind == FailureKind::RateLimit {
            return RATE_LIMIT_DELAY;
        }
        let raw = self
            .base_delay
            .saturating_mul(self.schedule.factor(attempt) as u32);
        let capped = raw.min(self.max_delay);
        let jittered = if self.jitter {
            let ms = capped.as_millis() as f64;
            let factor = rand::thread_rng().gen_range(0.8..=1.2);
            Duration::from_millis((ms * factor) as u64)
        } else {
            capped
        };
        jittered.max(Duration::from_millis(100))
    }
}

// ---------------------------------------------------------------------------
// Retry notice
// ---------------------------------------------------------------------------

/// Passed to the retry callback before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryNotice {
    /// 1-based attempt that just failed.
    pub attempt: u32,
    pub max_attempts: u32,
    pub verdict: Classified,
    pub delay: Duration,
}

// ---------------------------------------------------------------------------
// execute_with_retry
// ---------------------------------------------------------------------------

/// Run `op` under the retry policy and circuit breaker.
///
/// `op` receives the 1-based attempt number. `on_retry` fires once per
/// scheduled retry, before the backoff sleep, so callers can log the event.
/// Returns the classified failure when the breaker suppresses the call, the
/// failure is permanent, or the attempt budget is exhausted.
pub async fn execute_with_retry<T, Op, OpFut, Note, NoteFut>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    key: &str,
    mut op: Op,
    mut on_retry: Note,
) -> Result<T, Classified>
where
    Op: FnMut(u32) -> OpFut,
    OpFut: Future<Output = Result<T, AgentError>>,
    Note: FnMut(RetryNotice) -> NoteFut,
    NoteFut: Future<Output = ()>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let admitted = breaker.should_attempt(key).await.unwrap_or(true);
        if !admitted {
            warn!(key, "circuit breaker open; suppressing attempt");
            return Err(classify(&AgentError::BreakerOpen {
                key: key.to_string(),
            }));
        }

        match op(attempt).await {
            Ok(value) => {
                if let Err(e) = breaker.record_success(key).await {
                    warn!(key, error = %e, "failed to persist breaker success");
                }
                if attempt > 1 {
                    debug!(key, attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(err) => {
                if let Err(e) = breaker.record_failure(key).await {
                    warn!(key, error = %e, "failed to persist breaker failure");
                }
                let verdict = classify(&err);
                if !verdict.transient {
                    return Err(verdict);
                }
                if attempt >= policy.max_attempts {
                    warn!(key, attempts = attempt, "retry budget exhausted");
                    return Err(verdict);
                }
                let delay = policy.delay_for(attempt, verdict.kind);
                on_retry(RetryNotice {
                    attempt,
                    max_attempts: policy.max_attempts,
                    verdict: verdict.clone(),
                    delay,
                })
                .await;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            schedule: BackoffSchedule::Exponential,
            jitter: false,
        }
    }

    fn temp_breaker() -> (CircuitBreaker, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(dir.path(), BreakerConfig::default());
        (breaker, dir)
    }

    #[test]
    fn exponential_factors() {
        let s = BackoffSchedule::Exponential;
        assert_eq!(s.factor(1), 1);
        assert_eq!(s.factor(2), 2);
        assert_eq!(s.factor(3), 4);
    }

    #[test]
    fn linear_factors() {
        let s = BackoffSchedule::Linear;
        assert_eq!(s.factor(1), 1);
        assert_eq!(s.factor(4), 4);
    }

    #[test]
    fn fibonacci_factors() {
        let s = BackoffSchedule::Fibonacci;
        let factors: Vec<u64> = (1..=6).map(|n| s.factor(n)).collect();
        assert_eq!(factors, vec![1, 1, 2, 3, 5, 8]);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(30),
            schedule: BackoffSchedule::Exponential,
            jitter: false,
        };
        assert_eq!(
            policy.delay_for(5, FailureKind::AgentConnect),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn rate_limit_overrides_schedule() {
        let policy = fast_policy(3);
        assert_eq!(
            policy.delay_for(1, FailureKind::RateLimit),
            RATE_LIMIT_DELAY
        );
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            schedule: BackoffSchedule::Linear,
            jitter: true,
        };
        for _ in 0..100 {
            let d = policy.delay_for(1, FailureKind::AgentConnect);
            assert!(d >= Duration::from_secs(8), "delay too small: {d:?}");
            assert!(d <= Duration::from_secs(12), "delay too large: {d:?}");
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let (breaker, _dir) = temp_breaker();
        let result = execute_with_retry(
            &fast_policy(3),
            &breaker,
            "k",
            |_| async { Ok::<_, AgentError>(42) },
            |_| async {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_second_attempt() {
        let (breaker, _dir) = temp_breaker();
        let notices = Arc::new(AtomicU32::new(0));
        let notices_in_cb = notices.clone();

        let result = execute_with_retry(
            &fast_policy(3),
            &breaker,
            "k",
            |attempt| async move {
                if attempt == 1 {
                    Err(AgentError::Connect("transport closed".into()))
                } else {
                    Ok("summary".to_string())
                }
            },
            move |notice| {
                let notices = notices_in_cb.clone();
                async move {
                    assert_eq!(notice.attempt, 1);
                    notices.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "summary");
        assert_eq!(notices.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn permanent_failure_aborts_immediately() {
        let (breaker, _dir) = temp_breaker();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let notices = Arc::new(AtomicU32::new(0));
        let notices_in_cb = notices.clone();

        let result: Result<(), _> = execute_with_retry(
            &fast_policy(3),
            &breaker,
            "k",
            move |_| {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::Missing {
                        binary: "claude".into(),
                    })
                }
            },
            move |_| {
                let notices = notices_in_cb.clone();
                async move {
                    notices.fetch_add(1, Ordering::SeqCst);
                }
            },
        )
        .await;

        let verdict = result.unwrap_err();
        assert_eq!(verdict.kind, FailureKind::AgentMissing);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Permanent failures never schedule a retry.
        assert_eq!(notices.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_verdict() {
        let (breaker, _dir) = temp_breaker();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();

        let result: Result<(), _> = execute_with_retry(
            &fast_policy(3),
            &breaker,
            "k",
            move |_| {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::Connect("still down".into()))
                }
            },
            |_| async {},
        )
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::AgentConnect);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_breaker_suppresses_the_call() {
        let dir = tempfile::tempdir().unwrap();
        let breaker = CircuitBreaker::new(
            dir.path(),
            BreakerConfig {
                failure_threshold: 1,
                ..BreakerConfig::default()
            },
        );
        breaker.record_failure("k").await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_op = calls.clone();
        let result: Result<(), _> = execute_with_retry(
            &fast_policy(3),
            &breaker,
            "k",
            move |_| {
                let calls = calls_in_op.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(AgentError::Connect("unreached".into()))
                }
            },
            |_| async {},
        )
        .await;

        assert_eq!(result.unwrap_err().kind, FailureKind::BreakerOpen);
        // The operation never ran behind the open breaker.
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
