use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use weave_core::config::CircuitBreakerConfig;
use weave_core::error::{Result, WeaveError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time snapshot of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub concurrent_calls: u32,
}

/// Called with `(from, to)` on every transition.
pub type StateChangeFn = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    concurrent_calls: u32,
    /// Bumped on every entry into `HalfOpen`; tags the trials it admits.
    generation: u64,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl Inner {
    fn set_state(&mut self, next: CircuitState) -> Transition {
        if self.state == next {
            return None;
        }
        let prev = self.state;
        self.state = next;
        if prev == CircuitState::HalfOpen {
            self.concurrent_calls = 0;
        }
        if next == CircuitState::HalfOpen {
            self.generation += 1;
            self.success_count = 0;
            self.concurrent_calls = 0;
        }
        Some((prev, next))
    }
}

/// Call-gating state machine guarding one dependency.
///
/// `Closed` passes calls through and counts failures; at `failure_threshold`
/// it opens. `Open` rejects every call until `timeout` has passed since the
/// last failure, then the next call moves it to `HalfOpen`. `HalfOpen` admits
/// at most `max_concurrent_calls` trial calls; `success_threshold` successes
/// close it, any failure reopens it. A trial that outlives its half-open
/// period has its outcome ignored.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    on_state_change: Option<StateChangeFn>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_time: None,
                concurrent_calls: 0,
                generation: 0,
            }),
            on_state_change: None,
        }
    }

    /// Observe transitions. The callback runs after the internal lock is released.
    pub fn with_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let inner = self.lock();
        CircuitMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            concurrent_calls: inner.concurrent_calls,
        }
    }

    /// Force the breaker back to `Closed` with cleared counters.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.concurrent_calls = 0;
            inner.last_failure = None;
            inner.generation += 1;
            inner.set_state(CircuitState::Closed)
        };
        self.notify(transition);
    }

    /// Run `f` if the breaker admits it.
    ///
    /// Rejections return `CircuitOpen` / `CircuitHalfOpenSaturated` without
    /// calling `f`. `f` runs outside the lock; its outcome updates the
    /// counters afterwards.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (trial, transition) = self.admit()?;
        self.notify(transition);

        let mut guard = TrialGuard {
            breaker: self,
            trial,
        };
        let outcome = f().await;
        guard.trial = None;

        let transition = self.record(outcome.is_ok(), trial);
        self.notify(transition);
        outcome
    }

    /// Returns the generation of the half-open period a trial call belongs to.
    fn admit(&self) -> Result<(Option<u64>, Transition)> {
        let mut inner = self.lock();
        let mut transition = None;

        match inner.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                let elapsed_enough = inner
                    .last_failure
                    .map_or(true, |at| at.elapsed() >= self.config.timeout());
                if !elapsed_enough {
                    return Err(WeaveError::CircuitOpen);
                }
                transition = inner.set_state(CircuitState::HalfOpen);
            }
            CircuitState::HalfOpen => {
                if inner.concurrent_calls >= self.config.max_concurrent_calls {
                    return Err(WeaveError::CircuitHalfOpenSaturated);
                }
            }
        }

        let trial = if inner.state == CircuitState::HalfOpen {
            inner.concurrent_calls += 1;
            Some(inner.generation)
        } else {
            None
        };
        Ok((trial, transition))
    }

    fn record(&self, succeeded: bool, trial: Option<u64>) -> Transition {
        let mut inner = self.lock();
        let mut transition = None;

        if let Some(generation) = trial {
            if !release_trial(&mut inner, generation) {
                debug!(breaker = %self.name, generation, "Stale trial outcome ignored");
                return None;
            }
        }

        if succeeded {
            match inner.state {
                CircuitState::Closed => inner.failure_count = 0,
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.config.success_threshold {
                        transition = inner.set_state(CircuitState::Closed);
                        inner.failure_count = 0;
                        inner.success_count = 0;
                    }
                }
                CircuitState::Open => {}
            }
        } else {
            inner.failure_count += 1;
            inner.last_failure = Some(Instant::now());
            inner.last_failure_time = Some(Utc::now());
            match inner.state {
                CircuitState::Closed => {
                    if inner.failure_count >= self.config.failure_threshold {
                        transition = inner.set_state(CircuitState::Open);
                    }
                }
                CircuitState::HalfOpen => {
                    transition = inner.set_state(CircuitState::Open);
                    inner.success_count = 0;
                }
                CircuitState::Open => {}
            }
        }
        transition
    }

    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        if let Some(ref cb) = self.on_state_change {
            cb(&self.name, from, to);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Frees the slot of a trial from `generation`. False once that half-open
/// period has ended.
fn release_trial(inner: &mut Inner, generation: u64) -> bool {
    if inner.state != CircuitState::HalfOpen || inner.generation != generation {
        return false;
    }
    inner.concurrent_calls = inner.concurrent_calls.saturating_sub(1);
    true
}

/// Frees a half-open trial slot if the caller's future is dropped mid-call.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: Option<u64>,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.trial {
            debug!(breaker = %self.breaker.name, "Trial call abandoned, releasing slot");
            release_trial(&mut self.breaker.lock(), generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config(timeout_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms,
            max_concurrent_calls: 1,
        }
    }

    async fn fail(cb: &CircuitBreaker) -> Result<()> {
        cb.call(|| async { Err::<(), _>(WeaveError::agent("boom")) }).await
    }

    async fn succeed(cb: &CircuitBreaker) -> Result<u32> {
        cb.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("svc", config(60_000));
        for _ in 0..2 {
            assert!(fail(&cb).await.is_err());
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().failure_count, 3);
        assert!(cb.metrics().last_failure_time.is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_without_calling() {
        let cb = CircuitBreaker::new("svc", config(60_000));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }

        let calls = AtomicUsize::new(0);
        let result = cb
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(WeaveError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap_err().to_string(), "circuit breaker is open");
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_closes() {
        let cb = CircuitBreaker::new("svc", config(30));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(succeed(&cb).await.unwrap(), 7);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().success_count, 1);

        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        let m = cb.metrics();
        assert_eq!(m.failure_count, 0);
        assert_eq!(m.success_count, 0);
        assert_eq!(m.concurrent_calls, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("svc", config(20));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(fail(&cb).await.is_err());
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(succeed(&cb).await, Err(WeaveError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_trials() {
        let cb = Arc::new(CircuitBreaker::new("svc", config(10)));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let slow = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };
        started_rx.await.unwrap();

        assert_eq!(cb.metrics().concurrent_calls, 1);
        let rejected = succeed(&cb).await;
        assert!(matches!(rejected, Err(WeaveError::CircuitHalfOpenSaturated)));

        release_tx.send(()).unwrap();
        slow.await.unwrap().unwrap();
        assert_eq!(cb.metrics().concurrent_calls, 0);
    }

    #[tokio::test]
    async fn test_dropped_trial_releases_slot() {
        let cb = CircuitBreaker::new("svc", config(10));
        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = cb.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert_eq!(cb.metrics().concurrent_calls, 0);
    }

    #[tokio::test]
    async fn test_trial_from_earlier_half_open_is_ignored() {
        let cb = Arc::new(CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                timeout_ms: 10,
                max_concurrent_calls: 2,
            },
        ));
        let slow_trial = |cb: Arc<CircuitBreaker>| {
            let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
            let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                cb.call(|| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            });
            (handle, release_tx, started_rx)
        };

        let _ = fail(&cb).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (first, release_first, started) = slow_trial(cb.clone());
        started.await.unwrap();
        succeed(&cb).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().concurrent_calls, 0);

        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (second, release_second, started) = slow_trial(cb.clone());
        started.await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().concurrent_calls, 1);

        release_first.send(()).unwrap();
        first.await.unwrap().unwrap();
        let m = cb.metrics();
        assert_eq!(m.state, CircuitState::HalfOpen);
        assert_eq!(m.concurrent_calls, 1);
        assert_eq!(m.success_count, 0);

        release_second.send(()).unwrap();
        second.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().concurrent_calls, 0);
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failures() {
        let cb = CircuitBreaker::new("svc", config(60_000));
        let _ = fail(&cb).await;
        let _ = fail(&cb).await;
        succeed(&cb).await.unwrap();
        assert_eq!(cb.metrics().failure_count, 0);
        let _ = fail(&cb).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_state_change_callback() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let cb = CircuitBreaker::new("svc", config(10)).with_state_change(move |name, from, to| {
            seen.lock().unwrap().push((name.to_string(), from, to));
        });

        for _ in 0..3 {
            let _ = fail(&cb).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        succeed(&cb).await.unwrap();
        succeed(&cb).await.unwrap();
        cb.reset();

        let got = transitions.lock().unwrap().clone();
        assert_eq!(
            got,
            vec![
                ("svc".to_string(), CircuitState::Closed, CircuitState::Open),
                ("svc".to_string(), CircuitState::Open, CircuitState::HalfOpen),
                ("svc".to_string(), CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
    }
}
