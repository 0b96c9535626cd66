use serde_json::json;
use tokio_util::sync::CancellationToken;

use weave_core::config::{OrchestrationConfig, WeaveConfig};
use weave_core::error::WeaveError;
use weave_core::handler_fn;
use weave_core::types::{keys, AgentResult, Event, RuntimeEvent};
use weave_runtime::Runner;

const OK_SESSION: &str = "demo-ok";
const FAILING_SESSION: &str = "demo-fail";

/// Run a planner -> writer chain twice: once with a topic, once without,
/// which the writer rejects as a validation failure.
pub async fn run(config: &WeaveConfig, as_json: bool) -> anyhow::Result<()> {
    let mut config = config.clone();
    config.orchestration = OrchestrationConfig::default();
    let runner = Runner::from_config(&config)?;

    runner.register_agent(
        "planner",
        handler_fn(|_ctx, _event, mut state| async move {
            let topic = state.get_str("topic").unwrap_or("").to_string();
            state.set("outline", json!(["intro", topic, "summary"]));
            state.set_meta(keys::ROUTE, "writer");
            Ok(AgentResult::new(state))
        }),
    )?;
    runner.register_agent(
        "writer",
        handler_fn(|_ctx, _event, mut state| async move {
            let topic = match state.get_str("topic") {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => return Err(WeaveError::agent("validation failed: missing required field topic")),
            };
            state.set("draft", json!(format!("A short piece about {}", topic)));
            Ok(AgentResult::new(state))
        }),
    )?;
    runner.register_agent(
        "validation-error-handler",
        handler_fn(|_ctx, event: Event, mut state| async move {
            let reason = event.get("error").and_then(|v| v.as_str()).unwrap_or("unknown");
            state.set("apology", json!(format!("Could not write the piece: {}", reason)));
            Ok(AgentResult::new(state))
        }),
    )?;

    let mut rx = runner.event_bus().subscribe();
    runner.start(CancellationToken::new()).await?;

    runner.emit(
        Event::to("planner")
            .with_session(OK_SESSION)
            .with_data("topic", json!("ownership")),
    )?;
    runner.emit(Event::to("planner").with_session(FAILING_SESSION))?;
    runner.stop().await;

    for session in [OK_SESSION, FAILING_SESSION] {
        let trace = runner.dump_trace(session);
        if as_json {
            println!("{}", serde_json::to_string_pretty(&trace)?);
            continue;
        }
        println!("Session {}", session);
        for entry in &trace {
            let agent = if entry.agent_id.is_empty() {
                entry.target_agent_id.as_str()
            } else {
                entry.agent_id.as_str()
            };
            match &entry.error {
                Some(err) => println!("  {:<22} {:<26} error: {}", entry.hook.as_str(), agent, err),
                None => println!("  {:<22} {}", entry.hook.as_str(), agent),
            }
        }
        println!();
    }

    if !as_json {
        println!("Runtime events");
        while let Ok(event) = rx.try_recv() {
            if let Some(line) = describe(&event) {
                println!("  {}", line);
            }
        }
    }
    Ok(())
}

fn describe(event: &RuntimeEvent) -> Option<String> {
    match event {
        RuntimeEvent::ErrorRouted {
            handler,
            error_code,
            recovery_action,
            ..
        } => Some(format!(
            "error routed to {} ({}, {})",
            handler, error_code, recovery_action
        )),
        RuntimeEvent::ChainTerminated { session_id, reason } => {
            Some(format!("session {} terminated: {}", session_id, reason))
        }
        RuntimeEvent::ErrorUnhandled { agent_id, error, .. } => {
            Some(format!("unhandled failure in {}: {}", agent_id, error))
        }
        RuntimeEvent::RunnerStopped { processed } => {
            Some(format!("runner stopped after {} events", processed))
        }
        _ => None,
    }
}
