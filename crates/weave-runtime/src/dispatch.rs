use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use weave_core::context::RunContext;
use weave_core::error::{Result, WeaveError};
use weave_core::event::EventBus;
use weave_core::hooks::{CallbackArgs, CallbackRegistry, HookPoint};
use weave_core::traits::AgentHandler;
use weave_core::types::{AgentResult, Event, RuntimeEvent, State};
use weave_resilience::{CircuitBreaker, Retrier};

use crate::registry::AgentRegistry;

/// Invokes one agent with hooks, timeout, circuit breaker, and local retries.
///
/// Cheap to clone; every orchestration mode goes through the same instance.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<AgentRegistry>,
    callbacks: Arc<CallbackRegistry>,
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    retrier: Option<Arc<Retrier>>,
    bus: Arc<EventBus>,
    agent_timeout: Option<Duration>,
    callback_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        callbacks: Arc<CallbackRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            callbacks,
            breakers: Arc::new(RwLock::new(HashMap::new())),
            retrier: None,
            bus,
            agent_timeout: None,
            callback_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(Arc::new(retrier));
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Guard calls to `agent_id` with `breaker`, replacing any previous one.
    pub fn set_breaker(&self, agent_id: impl Into<String>, breaker: Arc<CircuitBreaker>) {
        let mut breakers = self.breakers.write().unwrap_or_else(|e| e.into_inner());
        breakers.insert(agent_id.into(), breaker);
    }

    pub fn breaker(&self, agent_id: &str) -> Option<Arc<CircuitBreaker>> {
        let breakers = self.breakers.read().unwrap_or_else(|e| e.into_inner());
        breakers.get(agent_id).cloned()
    }

    pub fn has_breaker(&self, agent_id: &str) -> bool {
        self.breaker(agent_id).is_some()
    }

    /// Run `agent_id` on `event` with `state`.
    ///
    /// Order: `BeforeAgentRun`, the handler (under timeout, breaker, and
    /// retrier when configured), then `AfterAgentRun` on success or
    /// `AgentError` on failure.
    pub async fn invoke(
        &self,
        agent_id: &str,
        ctx: &RunContext,
        event: &Event,
        state: State,
    ) -> Result<AgentResult> {
        let handler = self
            .registry
            .get(agent_id)
            .ok_or_else(|| WeaveError::AgentNotFound(agent_id.to_string()))?;

        let before = CallbackArgs::new(HookPoint::BeforeAgentRun, event.clone(), state.clone())
            .with_agent(agent_id);
        let state = match self.run_hook(ctx, before).await {
            Ok(state) => state,
            Err(e) => {
                self.report_failure(agent_id, ctx, event, state, &e).await;
                return Err(e);
            }
        };

        let start = Utc::now();
        let outcome = self.execute(&handler, agent_id, ctx, event, &state).await;
        let end = Utc::now();

        match outcome {
            Ok(result) => {
                let mut result = result.stamped(start, end);
                if let Some(ref soft) = result.error {
                    debug!(agent_id = %agent_id, error = %soft, "Agent reported a soft error");
                }

                let after = CallbackArgs::new(
                    HookPoint::AfterAgentRun,
                    event.clone(),
                    result.output_state.clone(),
                )
                .with_agent(agent_id)
                .with_result(result.clone());
                match self.run_hook(ctx, after).await {
                    Ok(rewritten) => result.output_state = rewritten,
                    Err(e) => {
                        warn!(agent_id = %agent_id, error = %e, "After-run callback failed");
                    }
                }

                self.bus.publish(RuntimeEvent::AgentCompleted {
                    agent_id: agent_id.to_string(),
                    event_id: event.id().to_string(),
                    elapsed_ms: result.duration_ms,
                });
                Ok(result)
            }
            Err(e) => {
                self.report_failure(agent_id, ctx, event, state, &e).await;
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        handler: &Arc<dyn AgentHandler>,
        agent_id: &str,
        ctx: &RunContext,
        event: &Event,
        state: &State,
    ) -> Result<AgentResult> {
        let timeout = self.agent_timeout;
        let attempt = |_attempt: u32| {
            let handler = handler.clone();
            let ctx = ctx.child();
            let event = event.clone();
            let state = state.clone();
            async move {
                let run = handler.run(ctx, event, state);
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, run).await {
                        Ok(result) => result,
                        Err(_) => Err(WeaveError::Timeout(limit.as_millis() as u64)),
                    },
                    None => run.await,
                }
            }
        };

        match (&self.retrier, self.breaker(agent_id)) {
            (Some(retrier), Some(breaker)) => retrier
                .execute_with_breaker(ctx.token(), &breaker, attempt)
                .await
                .into_result(),
            (Some(retrier), None) => retrier.execute(ctx.token(), attempt).await.into_result(),
            (None, Some(breaker)) => breaker.call(|| attempt(1)).await,
            (None, None) => attempt(1).await,
        }
    }

    async fn report_failure(
        &self,
        agent_id: &str,
        ctx: &RunContext,
        event: &Event,
        state: State,
        err: &WeaveError,
    ) {
        warn!(agent_id = %agent_id, event_id = %event.id(), error = %err, "Agent failed");

        let args = CallbackArgs::new(HookPoint::AgentError, event.clone(), state)
            .with_agent(agent_id)
            .with_error(err.to_string());
        if let Err(e) = self.run_hook(ctx, args).await {
            warn!(agent_id = %agent_id, error = %e, "Agent-error callback failed");
        }

        self.bus.publish(RuntimeEvent::AgentFailed {
            agent_id: agent_id.to_string(),
            event_id: event.id().to_string(),
            error: err.to_string(),
        });
    }

    /// Invoke the callbacks for `args.hook`, bounded by the callback timeout.
    pub async fn run_hook(&self, ctx: &RunContext, args: CallbackArgs) -> Result<State> {
        if self.callbacks.is_empty() {
            return Ok(args.state);
        }
        let hook = args.hook;
        match tokio::time::timeout(self.callback_timeout, self.callbacks.invoke(ctx, args)).await {
            Ok(result) => result,
            Err(_) => Err(WeaveError::Callback {
                hook: hook.to_string(),
                message: format!("timeout after {}ms", self.callback_timeout.as_millis()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use weave_core::config::{CircuitBreakerConfig, RetryPolicy};
    use weave_core::traits::handler_fn;
    use weave_resilience::CircuitState;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(CallbackRegistry::new()),
            Arc::new(EventBus::default()),
        )
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            jitter: false,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_invoke_unknown_agent() {
        let d = dispatcher();
        let ctx = RunContext::background("s");
        let err = d
            .invoke("ghost", &ctx, &Event::to("ghost"), State::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::AgentNotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_after_run_can_rewrite_state() {
        let d = dispatcher();
        d.registry()
            .register(
                "echo",
                Arc::new(handler_fn(|_, _, state| async move { Ok(AgentResult::new(state)) })),
            )
            .unwrap();
        d.callbacks()
            .register(HookPoint::AfterAgentRun, "stamp", |_, args: CallbackArgs| async move {
                let mut state = args.state;
                state.set_meta("processed_by", args.agent_id);
                Ok(Some(state))
            })
            .unwrap();

        let ctx = RunContext::background("s");
        let result = d
            .invoke("echo", &ctx, &Event::to("echo"), State::new())
            .await
            .unwrap();
        assert_eq!(result.output_state.get_meta("processed_by"), Some("echo"));
        assert!(result.end_time >= result.start_time);
    }

    #[tokio::test]
    async fn test_before_run_failure_skips_handler() {
        let d = dispatcher();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        d.registry()
            .register(
                "worker",
                Arc::new(handler_fn(move |_, _, state| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(AgentResult::new(state))
                    }
                })),
            )
            .unwrap();
        d.callbacks()
            .register(HookPoint::BeforeAgentRun, "gate", |_, _| async {
                Err(WeaveError::agent("blocked by gate"))
            })
            .unwrap();

        let ctx = RunContext::background("s");
        let err = d
            .invoke("worker", &ctx, &Event::to("worker"), State::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "blocked by gate");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_agent_timeout() {
        let d = dispatcher().with_agent_timeout(Some(Duration::from_millis(20)));
        d.registry()
            .register(
                "slow",
                Arc::new(handler_fn(|_, _, state| async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(AgentResult::new(state))
                })),
            )
            .unwrap();

        let ctx = RunContext::background("s");
        let err = d
            .invoke("slow", &ctx, &Event::to("slow"), State::new())
            .await
            .unwrap_err();
        assert!(matches!(err, WeaveError::Timeout(20)));
    }

    #[tokio::test]
    async fn test_retrier_recovers_transient_failure() {
        let d = dispatcher().with_retrier(Retrier::new(fast_policy(3)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        d.registry()
            .register(
                "flaky",
                Arc::new(handler_fn(move |_, _, mut state: State| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(WeaveError::agent("connection reset"));
                        }
                        state.set("ok", json!(true));
                        Ok(AgentResult::new(state))
                    }
                })),
            )
            .unwrap();

        let ctx = RunContext::background("s");
        let result = d
            .invoke("flaky", &ctx, &Event::to("flaky"), State::new())
            .await
            .unwrap();
        assert_eq!(result.output_state.get("ok"), Some(&json!(true)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_failures() {
        let d = dispatcher();
        d.registry()
            .register(
                "broken",
                Arc::new(handler_fn(|_, _, _| async { Err(WeaveError::agent("boom")) })),
            )
            .unwrap();
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            timeout_ms: 60_000,
            ..CircuitBreakerConfig::default()
        };
        d.set_breaker("broken", Arc::new(CircuitBreaker::new("broken", config)));

        let ctx = RunContext::background("s");
        let event = Event::to("broken");
        for _ in 0..2 {
            let err = d.invoke("broken", &ctx, &event, State::new()).await.unwrap_err();
            assert_eq!(err.to_string(), "boom");
        }
        assert_eq!(d.breaker("broken").unwrap().state(), CircuitState::Open);

        let err = d.invoke("broken", &ctx, &event, State::new()).await.unwrap_err();
        assert!(matches!(err, WeaveError::CircuitOpen));
    }

    #[tokio::test]
    async fn test_open_breaker_keeps_handler_error() {
        let d = dispatcher().with_retrier(Retrier::new(fast_policy(3)));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        d.registry()
            .register(
                "upstream",
                Arc::new(handler_fn(move |_, _, _| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async { Err(WeaveError::agent("connection refused")) }
                })),
            )
            .unwrap();
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            timeout_ms: 60_000,
            ..CircuitBreakerConfig::default()
        };
        d.set_breaker("upstream", Arc::new(CircuitBreaker::new("upstream", config)));

        let ctx = RunContext::background("s");
        let err = d
            .invoke("upstream", &ctx, &Event::to("upstream"), State::new())
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "connection refused");
        assert_eq!(err.local_retries(), 1);
        assert_eq!(d.breaker("upstream").unwrap().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_failure_published_on_bus() {
        let d = dispatcher();
        let mut rx = d.bus().subscribe();
        d.registry()
            .register(
                "broken",
                Arc::new(handler_fn(|_, _, _| async { Err(WeaveError::agent("boom")) })),
            )
            .unwrap();

        let ctx = RunContext::background("s");
        let _ = d.invoke("broken", &ctx, &Event::to("broken"), State::new()).await;
        match rx.try_recv().unwrap() {
            RuntimeEvent::AgentFailed { agent_id, error, .. } => {
                assert_eq!(agent_id, "broken");
                assert_eq!(error, "boom");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
