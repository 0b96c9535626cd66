use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use weave_core::context::RunContext;
use weave_core::error::WeaveError;
use weave_core::types::{keys, AgentResult, Event, RuntimeEvent, State};

use super::{Dispatched, Failure, Outcome};
use crate::dispatch::Dispatcher;

/// How a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The agent signalled completion.
    ConditionMet { iterations: u32 },
    /// The iteration ceiling was hit first.
    MaxIterationsReached { iterations: u32 },
}

impl LoopOutcome {
    pub fn iterations(&self) -> u32 {
        match self {
            LoopOutcome::ConditionMet { iterations }
            | LoopOutcome::MaxIterationsReached { iterations } => *iterations,
        }
    }

    pub fn condition_met(&self) -> bool {
        matches!(self, LoopOutcome::ConditionMet { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LoopOutcome::ConditionMet { .. } => "condition_met",
            LoopOutcome::MaxIterationsReached { .. } => "max_iterations_reached",
        }
    }

    /// Read the outcome recorded in a result's metadata.
    pub fn from_result(result: &AgentResult) -> Option<Self> {
        let iterations = result.metadata.get(keys::LOOP_ITERATIONS)?.parse().ok()?;
        match result.metadata.get(keys::LOOP_OUTCOME)?.as_str() {
            "condition_met" => Some(LoopOutcome::ConditionMet { iterations }),
            "max_iterations_reached" => Some(LoopOutcome::MaxIterationsReached { iterations }),
            _ => None,
        }
    }
}

/// Whether the agent asked the loop to stop: `loop_continue = false` or
/// `loop_completed = true`, as a data bool or a metadata string.
pub fn should_stop(state: &State) -> bool {
    let flag = |key: &str| -> Option<bool> {
        match state.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => state.get_meta(key).and_then(|v| v.parse().ok()),
        }
    };
    flag(keys::LOOP_CONTINUE) == Some(false) || flag(keys::LOOP_COMPLETED) == Some(true)
}

/// Invoke `agent` repeatedly, threading its output state, until it signals
/// completion or `max_iterations` runs have happened.
pub async fn run(
    dispatcher: &Dispatcher,
    ctx: &RunContext,
    event: &Event,
    state: State,
    agent: &str,
    max_iterations: u32,
) -> Outcome {
    let start = Utc::now();
    let ceiling = max_iterations.max(1);
    let mut state = state;
    let mut iterations = 0;
    let mut soft_error = None;

    let outcome = loop {
        if iterations >= ceiling {
            break LoopOutcome::MaxIterationsReached { iterations };
        }
        if ctx.is_cancelled() {
            return Err(Failure::new(agent, WeaveError::Cancelled));
        }
        iterations += 1;

        let result = dispatcher
            .invoke(agent, ctx, event, state)
            .await
            .map_err(|e| Failure::new(agent, WeaveError::stage("loop", agent, e)))?;
        debug!(agent_id = %agent, iteration = iterations, "Loop iteration finished");

        soft_error = result.error;
        state = result.output_state;
        if should_stop(&state) {
            break LoopOutcome::ConditionMet { iterations };
        }
    };

    info!(
        agent_id = %agent,
        iterations = outcome.iterations(),
        outcome = outcome.as_str(),
        "Loop finished"
    );
    dispatcher.bus().publish(RuntimeEvent::LoopFinished {
        agent_id: agent.to_string(),
        iterations: outcome.iterations(),
        condition_met: outcome.condition_met(),
    });

    let mut result = AgentResult::new(state)
        .stamped(start, Utc::now())
        .with_meta(keys::LOOP_OUTCOME, outcome.as_str())
        .with_meta(keys::LOOP_ITERATIONS, outcome.iterations().to_string());
    result.error = soft_error;
    Ok(Dispatched {
        agent_id: agent.to_string(),
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use weave_core::event::EventBus;
    use weave_core::hooks::CallbackRegistry;
    use weave_core::traits::handler_fn;

    use crate::registry::AgentRegistry;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(CallbackRegistry::new()),
            Arc::new(EventBus::default()),
        )
    }

    /// Counts iterations in state; stops itself once `stop_at` is reached.
    fn counter(stop_at: Option<i64>) -> Arc<dyn weave_core::traits::AgentHandler> {
        Arc::new(handler_fn(move |_, _, mut state: State| async move {
            let n = state.get("n").and_then(Value::as_i64).unwrap_or(0) + 1;
            state.set("n", json!(n));
            if stop_at == Some(n) {
                state.set(keys::LOOP_CONTINUE, json!(false));
            }
            Ok(AgentResult::new(state))
        }))
    }

    #[test]
    fn test_should_stop_flags() {
        let mut state = State::new();
        assert!(!should_stop(&state));
        state.set(keys::LOOP_CONTINUE, json!(true));
        assert!(!should_stop(&state));
        state.set(keys::LOOP_CONTINUE, json!(false));
        assert!(should_stop(&state));

        let mut state = State::new();
        state.set_meta(keys::LOOP_COMPLETED, "true");
        assert!(should_stop(&state));
    }

    #[tokio::test]
    async fn test_condition_met() {
        let d = dispatcher();
        let mut rx = d.bus().subscribe();
        d.registry().register("refine", counter(Some(3))).unwrap();

        let ctx = RunContext::background("s");
        let out = run(&d, &ctx, &Event::to("refine"), State::new(), "refine", 10)
            .await
            .unwrap();
        assert_eq!(
            LoopOutcome::from_result(&out.result),
            Some(LoopOutcome::ConditionMet { iterations: 3 })
        );
        assert_eq!(out.result.output_state.get("n"), Some(&json!(3)));

        let mut finished = None;
        while let Ok(ev) = rx.try_recv() {
            if let RuntimeEvent::LoopFinished { iterations, condition_met, .. } = ev {
                finished = Some((iterations, condition_met));
            }
        }
        assert_eq!(finished, Some((3, true)));
    }

    #[tokio::test]
    async fn test_max_iterations_reached() {
        let d = dispatcher();
        d.registry().register("refine", counter(None)).unwrap();

        let ctx = RunContext::background("s");
        let out = run(&d, &ctx, &Event::to("refine"), State::new(), "refine", 4)
            .await
            .unwrap();
        assert_eq!(
            LoopOutcome::from_result(&out.result),
            Some(LoopOutcome::MaxIterationsReached { iterations: 4 })
        );
        assert_eq!(out.result.metadata.get(keys::LOOP_OUTCOME).map(String::as_str), Some("max_iterations_reached"));
        assert_eq!(out.result.output_state.get("n"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_iteration_error_stops_loop() {
        let d = dispatcher();
        d.registry()
            .register(
                "bad",
                Arc::new(handler_fn(|_, _, _| async { Err(WeaveError::agent("quota exceeded")) })),
            )
            .unwrap();

        let ctx = RunContext::background("s");
        let failure = run(&d, &ctx, &Event::to("bad"), State::new(), "bad", 3)
            .await
            .unwrap_err();
        assert_eq!(failure.agent_id, "bad");
        assert_eq!(failure.error.to_string(), "loop agent bad failed: quota exceeded");
    }
}
