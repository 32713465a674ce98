//! Retry policy execution and the circuit breaker.
//!
//! Every step attempt is wrapped here: the breaker is consulted *before* the
//! attempt, the attempt is bounded by the step timeout, failures feed the
//! breaker, and backoff sleeps race the run's cancellation token.

use std::future::Future;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use trellis_types::document::RetryPolicy;
use trellis_types::error::EngineError;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Per-key breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    /// Healthy; counts consecutive failures.
    Closed { failures: u32 },
    /// Failing fast until the recovery timeout elapses.
    Open { since: Instant },
    /// One trial call is in flight.
    HalfOpen,
}

/// Failure-rate guard keyed by `step_id:step_type`.
///
/// Each failure increments a counter; at the threshold the breaker opens and
/// further calls fail fast with `CircuitOpen` until the recovery timeout
/// elapses, after which a single half-open trial is admitted. A successful
/// trial closes the breaker; a failed one re-opens it.
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            states: DashMap::new(),
        }
    }

    /// Consult the breaker before an attempt.
    ///
    /// Open + recovery elapsed transitions to half-open and admits the call;
    /// open otherwise fails fast.
    pub fn check(&self, key: &str) -> Result<(), EngineError> {
        let mut entry = self
            .states
            .entry(key.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });
        match *entry {
            BreakerState::Closed { .. } | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open { since } => {
                if since.elapsed() >= self.recovery_timeout {
                    tracing::debug!(key, "circuit breaker half-open, admitting trial call");
                    *entry = BreakerState::HalfOpen;
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        key: key.to_string(),
                    })
                }
            }
        }
    }

    /// Record a successful attempt; closes the breaker.
    pub fn record_success(&self, key: &str) {
        self.states
            .insert(key.to_string(), BreakerState::Closed { failures: 0 });
    }

    /// Record a failed attempt; may open the breaker.
    pub fn record_failure(&self, key: &str) {
        let mut entry = self
            .states
            .entry(key.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });
        *entry = match *entry {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    tracing::warn!(key, failures, "circuit breaker opened");
                    BreakerState::Open {
                        since: Instant::now(),
                    }
                } else {
                    BreakerState::Closed { failures }
                }
            }
            // A failed half-open trial re-opens immediately.
            BreakerState::HalfOpen | BreakerState::Open { .. } => BreakerState::Open {
                since: Instant::now(),
            },
        };
    }

    /// Whether the breaker currently fails fast for this key.
    pub fn is_open(&self, key: &str) -> bool {
        matches!(
            self.states.get(key).map(|s| *s),
            Some(BreakerState::Open { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Retry execution
// ---------------------------------------------------------------------------

/// Run `attempt_fn` under a retry policy, a per-attempt timeout, and the
/// circuit breaker.
///
/// Returns the result value and the number of attempts used. Backoff sleeps
/// race the cancellation token; `CircuitOpen` and `Cancelled` propagate
/// unwrapped, everything else surfaces as `StepExecution` after the final
/// attempt.
pub async fn execute_with_policy<T, F, Fut>(
    step_id: &str,
    breaker_key: &str,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    breaker: &CircuitBreaker,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<(T, u32), EngineError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error: Option<EngineError> = None;

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        breaker.check(breaker_key)?;

        let outcome = tokio::time::timeout(attempt_timeout, attempt_fn(attempt)).await;
        match outcome {
            Ok(Ok(value)) => {
                breaker.record_success(breaker_key);
                return Ok((value, attempt));
            }
            Ok(Err(EngineError::Cancelled)) => return Err(EngineError::Cancelled),
            Ok(Err(err @ EngineError::ComponentNotFound { .. })) => {
                // Retrying cannot register a missing component.
                breaker.record_failure(breaker_key);
                return Err(err);
            }
            Ok(Err(err)) => {
                breaker.record_failure(breaker_key);
                tracing::debug!(
                    step_id,
                    attempt,
                    max_attempts,
                    error = %err,
                    "step attempt failed"
                );
                last_error = Some(err);
            }
            Err(_elapsed) => {
                breaker.record_failure(breaker_key);
                tracing::debug!(step_id, attempt, max_attempts, "step attempt timed out");
                last_error = Some(EngineError::StepTimeout {
                    step_id: step_id.to_string(),
                });
            }
        }

        if attempt < max_attempts {
            let delay = policy.delay_after(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            }
        }
    }

    // Attempt errors may already be StepExecution wrappers from the leaf
    // executors; take their inner message instead of nesting.
    let message = match last_error {
        Some(EngineError::StepExecution { message, .. }) => message,
        Some(e) => e.to_string(),
        None => "unknown failure".to_string(),
    };
    Err(EngineError::StepExecution {
        step_id: step_id.to_string(),
        attempts: max_attempts,
        message,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use trellis_types::document::BackoffKind;

    fn policy(max_attempts: u32, backoff_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: BackoffKind::Linear,
            backoff_ms,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(5, Duration::from_secs(30))
    }

    // -----------------------------------------------------------------------
    // Retry execution
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn success_on_first_attempt() {
        let result = execute_with_policy(
            "s",
            "s:action",
            &policy(3, 10),
            Duration::from_secs(1),
            &breaker(),
            &CancellationToken::new(),
            |_attempt| async { Ok(json!("ok")) },
        )
        .await
        .unwrap();
        assert_eq!(result, (json!("ok"), 1));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_step_makes_exactly_max_attempts_with_growing_gaps() {
        let attempts = Arc::new(AtomicU32::new(0));
        let timestamps: Arc<std::sync::Mutex<Vec<Instant>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        let attempts_in = Arc::clone(&attempts);
        let timestamps_in = Arc::clone(&timestamps);
        let err = execute_with_policy(
            "flaky",
            "flaky:action",
            &policy(3, 100),
            Duration::from_secs(1),
            &breaker(),
            &CancellationToken::new(),
            move |_attempt| {
                let attempts = Arc::clone(&attempts_in);
                let timestamps = Arc::clone(&timestamps_in);
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    timestamps.lock().unwrap().push(Instant::now());
                    Err::<Value, _>(EngineError::Validation("boom".to_string()))
                }
            },
        )
        .await
        .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match &err {
            EngineError::StepExecution {
                step_id, attempts, ..
            } => {
                assert_eq!(step_id, "flaky");
                assert_eq!(*attempts, 3);
            }
            other => panic!("expected StepExecution, got {other}"),
        }

        let stamps = timestamps.lock().unwrap();
        let gap1 = stamps[1] - stamps[0];
        let gap2 = stamps[2] - stamps[1];
        assert!(gap1 >= Duration::from_millis(100), "first gap {gap1:?}");
        assert!(gap2 >= Duration::from_millis(200), "second gap {gap2:?}");
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_in = Arc::clone(&attempts);
        let (value, used) = execute_with_policy(
            "s",
            "s:action",
            &policy(3, 1),
            Duration::from_secs(1),
            &breaker(),
            &CancellationToken::new(),
            move |_attempt| {
                let attempts = Arc::clone(&attempts_in);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(EngineError::Validation("transient".to_string()))
                    } else {
                        Ok(json!("recovered"))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, json!("recovered"));
        assert_eq!(used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_failure() {
        let err = execute_with_policy(
            "slow",
            "slow:action",
            &policy(1, 1),
            Duration::from_millis(50),
            &breaker(),
            &CancellationToken::new(),
            |_attempt| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            },
        )
        .await
        .unwrap_err();
        match err {
            EngineError::StepExecution { message, .. } => {
                assert!(message.contains("timed out"), "got: {message}");
            }
            other => panic!("expected StepExecution, got {other}"),
        }
    }

    #[tokio::test]
    async fn cancellation_aborts_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = execute_with_policy(
            "s",
            "s:action",
            &policy(3, 10_000),
            Duration::from_secs(1),
            &breaker(),
            &cancel,
            |_attempt| async { Err::<Value, _>(EngineError::Validation("x".to_string())) },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    // -----------------------------------------------------------------------
    // Circuit breaker
    // -----------------------------------------------------------------------

    #[test]
    fn breaker_opens_at_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure("a:action");
        breaker.record_failure("a:action");
        assert!(!breaker.is_open("a:action"));
        breaker.record_failure("a:action");
        assert!(breaker.is_open("a:action"));
    }

    #[tokio::test]
    async fn open_breaker_fails_fast() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure("a:action");

        let err = breaker.check("a:action").unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));

        // The retry wrapper surfaces it without attempting execution.
        let ran = Arc::new(AtomicU32::new(0));
        let ran_in = Arc::clone(&ran);
        let err = execute_with_policy(
            "a",
            "a:action",
            &policy(3, 1),
            Duration::from_secs(1),
            &breaker,
            &CancellationToken::new(),
            move |_attempt| {
                let ran = Arc::clone(&ran_in);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("should not run"))
                }
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::CircuitOpen { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_half_open_after_recovery_then_closes_on_success() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100));
        breaker.record_failure("a:action");
        assert!(breaker.check("a:action").is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Recovery elapsed: half-open admits one trial.
        assert!(breaker.check("a:action").is_ok());
        breaker.record_success("a:action");
        assert!(breaker.check("a:action").is_ok());
        assert!(!breaker.is_open("a:action"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_half_open_trial_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(100));
        breaker.record_failure("a:action");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(breaker.check("a:action").is_ok());
        breaker.record_failure("a:action");
        assert!(breaker.check("a:action").is_err());
    }

    #[test]
    fn breaker_keys_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(30));
        breaker.record_failure("a:action");
        assert!(breaker.is_open("a:action"));
        assert!(breaker.check("b:action").is_ok());
    }
}
