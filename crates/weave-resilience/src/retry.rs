use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use weave_core::config::RetryPolicy;
use weave_core::error::{Result, WeaveError};
use weave_core::failure::ErrorCode;

use crate::circuit_breaker::CircuitBreaker;
use crate::classify::classify;

/// Invoked before each backoff sleep with `(attempt, error, delay)`.
pub type OnRetryFn = Arc<dyn Fn(u32, &WeaveError, Duration) + Send + Sync>;
/// Invoked once when the retrier stops on a failure with `(attempts, error)`.
pub type OnGiveUpFn = Arc<dyn Fn(u32, &WeaveError) + Send + Sync>;

/// Outcome of [`Retrier::execute`].
#[derive(Debug)]
pub struct RetryResult<T> {
    pub value: Option<T>,
    pub success: bool,
    pub attempt_count: u32,
    /// Every failure in attempt order; a cancellation during backoff is the
    /// final entry.
    pub error_history: Vec<WeaveError>,
    pub total_duration: Duration,
}

impl<T> RetryResult<T> {
    pub fn last_error(&self) -> Option<&WeaveError> {
        self.error_history.last()
    }

    /// The failure that ended the run.
    ///
    /// Breaker rejections only say the guard closed; the handler's last own
    /// error is preferred over them when there is one.
    pub fn final_error(&self) -> Option<&WeaveError> {
        self.final_error_index().map(|i| &self.error_history[i])
    }

    fn final_error_index(&self) -> Option<usize> {
        self.error_history
            .iter()
            .rposition(|e| !is_breaker_rejection(e))
            .or_else(|| self.error_history.len().checked_sub(1))
    }

    /// The value, or [`final_error`](Self::final_error) tagged with the
    /// number of attempts spent.
    pub fn into_result(mut self) -> Result<T> {
        if let Some(v) = self.value.take().filter(|_| self.success) {
            return Ok(v);
        }
        let err = match self.final_error_index() {
            Some(i) => self.error_history.swap_remove(i),
            None => WeaveError::agent("retry finished without a result"),
        };
        Err(WeaveError::exhausted(self.attempt_count, err))
    }
}

fn is_breaker_rejection(err: &WeaveError) -> bool {
    matches!(
        err,
        WeaveError::CircuitOpen | WeaveError::CircuitHalfOpenSaturated
    )
}

/// Exponential-backoff retry executor.
///
/// Stateless between calls: one `Retrier` can serve many concurrent
/// executions.
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    on_retry: Option<OnRetryFn>,
    on_give_up: Option<OnGiveUpFn>,
}

impl Retrier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            on_retry: None,
            on_give_up: None,
        }
    }

    pub fn with_on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &WeaveError, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(f));
        self
    }

    pub fn with_on_give_up<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &WeaveError) + Send + Sync + 'static,
    {
        self.on_give_up = Some(Arc::new(f));
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` up to `max_retries + 1` times. `f` receives the 1-based attempt.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, mut f: F) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut history = Vec::new();
        let max_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;

        while attempt < max_attempts {
            attempt += 1;
            let err = match f(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return RetryResult {
                        value: Some(value),
                        success: true,
                        attempt_count: attempt,
                        error_history: history,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => e,
            };

            if attempt > self.policy.max_retries || !self.is_retryable(&err) {
                if let Some(ref cb) = self.on_give_up {
                    cb(attempt, &err);
                }
                debug!(attempt, error = %err, "Giving up");
                history.push(err);
                break;
            }

            let delay = self.backoff_delay(attempt);
            warn!(
                attempt,
                max_retries = self.policy.max_retries,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            if let Some(ref cb) = self.on_retry {
                cb(attempt, &err, delay);
            }
            history.push(err);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    history.push(WeaveError::Cancelled);
                    break;
                }
            }
        }

        RetryResult {
            value: None,
            success: false,
            attempt_count: attempt,
            error_history: history,
            total_duration: start.elapsed(),
        }
    }

    /// Like [`execute`](Self::execute), with every attempt gated by `breaker`.
    pub async fn execute_with_breaker<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        breaker: &CircuitBreaker,
        mut f: F,
    ) -> RetryResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(cancel, |attempt| {
            let fut = f(attempt);
            async move { breaker.call(|| fut).await }
        })
        .await
    }

    /// Whether this policy retries `err`.
    ///
    /// Matches the rendered message against the configured codes (`CODE`,
    /// `error code: CODE`, `code=CODE`), then falls back to classifying it.
    pub fn is_retryable(&self, err: &WeaveError) -> bool {
        if matches!(err, WeaveError::Cancelled) {
            return false;
        }
        let message = err.to_string();
        if let Some(code) = explicit_code(&message) {
            return self.policy.retryable_errors.contains(&code);
        }
        let (code, _) = classify(&message);
        self.policy.retryable_errors.contains(&code)
    }

    /// Backoff before attempt `attempt + 1`, jitter included.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let sample = if self.policy.jitter {
            Some(rand::random::<f64>())
        } else {
            None
        };
        compute_delay(&self.policy, attempt, sample)
    }
}

/// `min(max, initial * factor^(attempt-1))`, then, with a jitter sample in
/// `[0, 1)`, perturbed by up to ±10%. A negative result falls back to the
/// initial delay.
pub fn compute_delay(policy: &RetryPolicy, attempt: u32, jitter_sample: Option<f64>) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = policy.initial_delay_ms as f64 * policy.backoff_factor.powi(exponent);
    let mut delay = base.min(policy.max_delay_ms as f64);

    if let Some(r) = jitter_sample {
        delay += (r * 2.0 - 1.0) * 0.1 * delay;
    }
    if delay < 0.0 || !delay.is_finite() {
        return policy.initial_delay();
    }
    Duration::from_millis(delay as u64)
}

fn explicit_code(message: &str) -> Option<ErrorCode> {
    static CODE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CODE_RE
        .get_or_init(|| Regex::new(r"^(?:error code: |code=)?([A-Z]+_ERROR)$").ok())
        .as_ref()?;
    let caps = re.captures(message.trim())?;
    caps.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weave_core::config::CircuitBreakerConfig;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    /// Fails with a timeout `k` times, then succeeds.
    async fn run_flaky(retrier: &Retrier, k: u32) -> RetryResult<&'static str> {
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        retrier
            .execute(&cancel, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < k {
                        Err(WeaveError::agent("upstream timeout"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
    }

    #[tokio::test]
    async fn test_succeeds_within_budget() {
        let retrier = Retrier::new(fast_policy(3));
        for k in 0..=3 {
            let result = run_flaky(&retrier, k).await;
            assert!(result.success, "k = {}", k);
            assert_eq!(result.attempt_count, k + 1);
            assert_eq!(result.error_history.len(), k as usize);
            assert_eq!(result.value, Some("done"));
        }
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let retrier = Retrier::new(fast_policy(2));
        let result = run_flaky(&retrier, 5).await;
        assert!(!result.success);
        assert_eq!(result.attempt_count, 3);
        assert_eq!(result.error_history.len(), 3);
        assert_eq!(result.last_error().unwrap().to_string(), "upstream timeout");
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let gave_up = Arc::new(AtomicU32::new(0));
        let seen = gave_up.clone();
        let retrier = Retrier::new(fast_policy(3)).with_on_give_up(move |attempts, _| {
            seen.store(attempts, Ordering::SeqCst);
        });
        let cancel = CancellationToken::new();
        let result: RetryResult<()> = retrier
            .execute(&cancel, |_| async { Err(WeaveError::agent("field is required")) })
            .await;

        assert!(!result.success);
        assert_eq!(result.attempt_count, 1);
        assert_eq!(gave_up.load(Ordering::SeqCst), 1);
        assert!(result.into_result().is_err());
    }

    #[tokio::test]
    async fn test_on_retry_sees_each_backoff() {
        let retries = Arc::new(AtomicU32::new(0));
        let counter = retries.clone();
        let retrier = Retrier::new(fast_policy(3)).with_on_retry(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let result = run_flaky(&retrier, 2).await;
        assert!(result.success);
        assert_eq!(retries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter: false,
            ..RetryPolicy::default()
        };
        let retrier = Retrier::new(policy);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result: RetryResult<()> = retrier
            .execute(&cancel, |_| async { Err(WeaveError::agent("network down")) })
            .await;
        assert!(!result.success);
        assert_eq!(result.attempt_count, 1);
        assert!(matches!(result.last_error(), Some(WeaveError::Cancelled)));
        assert!(result.total_duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_breaker_rejection_is_not_retried() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            },
        );
        let retrier = Retrier::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: RetryResult<()> = retrier
            .execute_with_breaker(&cancel, &breaker, |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WeaveError::agent("connection refused"))
            })
            .await;

        // First attempt fails and opens the breaker; the retry is rejected
        // without reaching the closure.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.attempt_count, 2);
        assert!(matches!(result.last_error(), Some(WeaveError::CircuitOpen)));
        assert_eq!(
            result.final_error().map(ToString::to_string).as_deref(),
            Some("connection refused")
        );

        let err = result.into_result().unwrap_err();
        assert_eq!(err.to_string(), "connection refused");
        assert_eq!(err.local_retries(), 1);
    }

    #[tokio::test]
    async fn test_rejection_only_history_keeps_rejection() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 1,
                timeout_ms: 60_000,
                ..CircuitBreakerConfig::default()
            },
        );
        let _ = breaker
            .call(|| async { Err::<(), _>(WeaveError::agent("boom")) })
            .await;

        let retrier = Retrier::new(fast_policy(3));
        let cancel = CancellationToken::new();
        let result: RetryResult<()> = retrier
            .execute_with_breaker(&cancel, &breaker, |_| async { Ok(()) })
            .await;
        assert!(matches!(result.into_result(), Err(WeaveError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_exhausted_error_carries_attempts() {
        let retrier = Retrier::new(fast_policy(2));
        let err = run_flaky(&retrier, 5).await.into_result().unwrap_err();
        assert!(matches!(err, WeaveError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.local_retries(), 2);
        assert_eq!(err.to_string(), "upstream timeout");
    }

    #[test]
    fn test_compute_delay_growth_and_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(compute_delay(&policy, 1, None), Duration::from_millis(100));
        assert_eq!(compute_delay(&policy, 2, None), Duration::from_millis(200));
        assert_eq!(compute_delay(&policy, 4, None), Duration::from_millis(800));
        assert_eq!(compute_delay(&policy, 5, None), Duration::from_millis(1_000));
    }

    #[test]
    fn test_compute_delay_jitter_bounds() {
        let policy = RetryPolicy {
            initial_delay_ms: 1_000,
            ..RetryPolicy::default()
        };
        assert_eq!(compute_delay(&policy, 1, Some(0.0)), Duration::from_millis(900));
        assert_eq!(compute_delay(&policy, 1, Some(0.5)), Duration::from_millis(1_000));
        let high = compute_delay(&policy, 1, Some(0.999_999));
        assert!(high <= Duration::from_millis(1_100));
        assert!(high >= Duration::from_millis(1_099));
    }

    #[test]
    fn test_explicit_code_forms() {
        let retrier = Retrier::new(RetryPolicy::default());
        assert!(retrier.is_retryable(&WeaveError::agent("TIMEOUT_ERROR")));
        assert!(retrier.is_retryable(&WeaveError::agent("error code: NETWORK_ERROR")));
        assert!(retrier.is_retryable(&WeaveError::agent("code=LLM_ERROR")));
        assert!(!retrier.is_retryable(&WeaveError::agent("code=AUTH_ERROR")));
        assert!(!retrier.is_retryable(&WeaveError::agent("missing field")));
        assert!(!retrier.is_retryable(&WeaveError::Cancelled));
    }
}
