use chrono::Utc;
use tracing::{debug, warn};

use weave_core::context::RunContext;
use weave_core::error::WeaveError;
use weave_core::types::{AgentResult, Event, State};

use super::{join_soft_errors, Dispatched, Failure, Outcome};
use crate::dispatch::Dispatcher;

/// Run `agents` in order, feeding each one's output state to the next.
///
/// Unregistered agents are skipped. The first hard error stops the run and
/// is reported as `<stage> agent <name> failed: <error>`.
pub async fn run(
    dispatcher: &Dispatcher,
    ctx: &RunContext,
    event: &Event,
    state: State,
    agents: &[String],
    stage: &'static str,
) -> Outcome {
    let start = Utc::now();
    let mut state = state;
    let mut soft_errors = Vec::new();
    let mut last_agent: Option<&str> = None;

    for name in agents {
        if !dispatcher.registry().contains(name) {
            warn!(agent_id = %name, stage, "Skipping unregistered agent");
            continue;
        }
        if ctx.is_cancelled() {
            return Err(Failure::new(name.as_str(), WeaveError::Cancelled));
        }

        debug!(agent_id = %name, stage, "Running stage agent");
        let result = dispatcher
            .invoke(name, ctx, event, state)
            .await
            .map_err(|e| Failure::new(name.as_str(), WeaveError::stage(stage, name.as_str(), e)))?;

        if let Some(soft) = result.error {
            soft_errors.push(format!("{}: {}", name, soft));
        }
        state = result.output_state;
        last_agent = Some(name);
    }

    let Some(agent_id) = last_agent else {
        return Err(Failure::new(
            stage,
            WeaveError::InvalidWorkflow(format!("{} plan has no registered agents", stage)),
        ));
    };

    let mut result = AgentResult::new(state).stamped(start, Utc::now());
    result.error = join_soft_errors(&soft_errors);
    Ok(Dispatched {
        agent_id: agent_id.to_string(),
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

    fn appender(tag: &'static str) -> Arc<dyn weave_core::traits::AgentHandler> {
        Arc::new(handler_fn(move |_, _, mut state: State| async move {
            let mut trail = state.get_str("trail").unwrap_or_default().to_string();
            trail.push_str(tag);
            state.set("trail", json!(trail));
            Ok(AgentResult::new(state))
        }))
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(
            Arc::new(AgentRegistry::new()),
            Arc::new(CallbackRegistry::new()),
            Arc::new(EventBus::default()),
        )
    }

    fn agents(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_threads_state_in_order() {
        let d = dispatcher();
        d.registry().register("a", appender("a")).unwrap();
        d.registry().register("b", appender("b")).unwrap();
        d.registry().register("c", appender("c")).unwrap();

        let ctx = RunContext::background("s");
        let out = run(&d, &ctx, &Event::to("a"), State::new(), &agents(&["c", "a", "b"]), "sequential")
            .await
            .unwrap();
        assert_eq!(out.result.output_state.get_str("trail"), Some("cab"));
        assert_eq!(out.agent_id, "b");
        assert!(out.result.error.is_none());
    }

    #[tokio::test]
    async fn test_skips_missing_and_collects_soft_errors() {
        let d = dispatcher();
        d.registry().register("a", appender("a")).unwrap();
        d.registry()
            .register(
                "warn",
                Arc::new(handler_fn(|_, _, state| async move {
                    Ok(AgentResult::new(state).with_error("low confidence"))
                })),
            )
            .unwrap();

        let ctx = RunContext::background("s");
        let out = run(&d, &ctx, &Event::to("a"), State::new(), &agents(&["a", "ghost", "warn"]), "sequential")
            .await
            .unwrap();
        assert_eq!(out.result.output_state.get_str("trail"), Some("a"));
        assert_eq!(out.result.error.as_deref(), Some("warn: low confidence"));
    }

    #[tokio::test]
    async fn test_hard_error_is_wrapped() {
        let d = dispatcher();
        d.registry().register("a", appender("a")).unwrap();
        d.registry()
            .register(
                "bad",
                Arc::new(handler_fn(|_, _, _| async { Err(WeaveError::agent("missing field")) })),
            )
            .unwrap();
        d.registry().register("c", appender("c")).unwrap();

        let ctx = RunContext::background("s");
        let failure = run(&d, &ctx, &Event::to("a"), State::new(), &agents(&["a", "bad", "c"]), "sequential")
            .await
            .unwrap_err();
        assert_eq!(failure.agent_id, "bad");
        assert_eq!(
            failure.error.to_string(),
            "sequential agent bad failed: missing field"
        );
    }

    #[tokio::test]
    async fn test_nothing_registered() {
        let d = dispatcher();
        let ctx = RunContext::background("s");
        let failure = run(&d, &ctx, &Event::to("x"), State::new(), &agents(&["x"]), "sequential")
            .await
            .unwrap_err();
        assert!(matches!(failure.error, WeaveError::InvalidWorkflow(_)));
    }
}
