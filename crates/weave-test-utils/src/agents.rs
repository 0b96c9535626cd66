use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;

use weave_core::context::RunContext;
use weave_core::error::{Result, WeaveError};
use weave_core::traits::AgentHandler;
use weave_core::types::{keys, AgentResult, Event, State};

/// Returns its input state, optionally with one data key set and a route.
#[derive(Clone, Default)]
pub struct EchoAgent {
    route: Option<String>,
    set: Option<(String, Value)>,
    calls: Arc<AtomicU32>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn routing_to(mut self, next: impl Into<String>) -> Self {
        self.route = Some(next.into());
        self
    }

    pub fn setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.set = Some((key.into(), value));
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentHandler for EchoAgent {
    fn run(&self, _ctx: RunContext, _event: Event, mut state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((key, value)) = &self.set {
                state.set(key.clone(), value.clone());
            }
            if let Some(route) = &self.route {
                state.set_meta(keys::ROUTE, route.clone());
            }
            Ok(AgentResult::new(state))
        })
    }
}

/// Always fails with the same message.
#[derive(Clone)]
pub struct FailingAgent {
    message: String,
    calls: Arc<AtomicU32>,
}

impl FailingAgent {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentHandler for FailingAgent {
    fn run(&self, _ctx: RunContext, _event: Event, _state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(WeaveError::agent(self.message.clone()))
        })
    }
}

/// Fails the first `failures` calls, then echoes its state.
#[derive(Clone)]
pub struct FlakyAgent {
    failures: u32,
    message: String,
    calls: Arc<AtomicU32>,
}

impl FlakyAgent {
    pub fn new(failures: u32, message: impl Into<String>) -> Self {
        Self {
            failures,
            message: message.into(),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentHandler for FlakyAgent {
    fn run(&self, _ctx: RunContext, _event: Event, state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(WeaveError::agent(self.message.clone()))
            } else {
                Ok(AgentResult::new(state))
            }
        })
    }
}

/// Records every `(event, state)` it receives.
///
/// Result metadata and a route can be attached to what it returns, which is
/// how tests script recovery handlers.
#[derive(Clone, Default)]
pub struct RecordingAgent {
    seen: Arc<Mutex<Vec<(Event, State)>>>,
    result_meta: Vec<(String, String)>,
    route: Option<String>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.result_meta.push((key.into(), value.into()));
        self
    }

    pub fn routing_to(mut self, next: impl Into<String>) -> Self {
        self.route = Some(next.into());
        self
    }

    pub fn records(&self) -> Vec<(Event, State)> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records().into_iter().map(|(event, _)| event).collect()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl AgentHandler for RecordingAgent {
    fn run(&self, _ctx: RunContext, event: Event, mut state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            self.seen
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((event, state.clone()));
            if let Some(route) = &self.route {
                state.set_meta(keys::ROUTE, route.clone());
            }
            let mut result = AgentResult::new(state);
            for (key, value) in &self.result_meta {
                result = result.with_meta(key.clone(), value.clone());
            }
            Ok(result)
        })
    }
}

/// Increments the `count` data key on every call and clears `loop_continue`
/// once the count reaches `stop_at`.
#[derive(Clone, Default)]
pub struct CountingAgent {
    stop_at: Option<u64>,
    calls: Arc<AtomicU32>,
}

impl CountingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stopping_at(stop_at: u64) -> Self {
        Self {
            stop_at: Some(stop_at),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AgentHandler for CountingAgent {
    fn run(&self, _ctx: RunContext, _event: Event, mut state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let count = state.get("count").and_then(Value::as_u64).unwrap_or(0) + 1;
            state.set("count", count.into());
            if self.stop_at.is_some_and(|stop| count >= stop) {
                state.set(keys::LOOP_CONTINUE, Value::Bool(false));
            }
            Ok(AgentResult::new(state))
        })
    }
}

/// Sleeps before echoing, or until cancelled.
#[derive(Clone)]
pub struct SlowAgent {
    delay: Duration,
}

impl SlowAgent {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl AgentHandler for SlowAgent {
    fn run(&self, ctx: RunContext, _event: Event, state: State) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => Ok(AgentResult::new(state)),
                _ = ctx.cancelled() => Err(WeaveError::Cancelled),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_recovers() {
        let agent = FlakyAgent::new(1, "connection reset");
        let ctx = RunContext::background("s");
        assert!(agent.run(ctx.clone(), Event::to("a"), State::new()).await.is_err());
        assert!(agent.run(ctx, Event::to("a"), State::new()).await.is_ok());
        assert_eq!(agent.calls(), 2);
    }

    #[tokio::test]
    async fn test_recording_agent_scripts_result() {
        let agent = RecordingAgent::new()
            .with_result_meta(keys::RECOVERY_ACTION, "retry")
            .routing_to("next");
        let handle = agent.clone();
        let result = agent
            .run(RunContext::background("s"), Event::to("rec"), State::new())
            .await
            .unwrap();
        assert_eq!(result.metadata.get(keys::RECOVERY_ACTION).map(String::as_str), Some("retry"));
        assert_eq!(result.route(), Some("next"));
        assert_eq!(handle.count(), 1);
    }
}
