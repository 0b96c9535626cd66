use chrono::Utc;
use futures::stream::{self, StreamExt};
use tracing::{debug, warn};

use weave_core::context::RunContext;
use weave_core::error::{MultiError, WeaveError};
use weave_core::types::{AgentResult, Event, State};

use super::{join_soft_errors, Dispatched, Failure, ModeSettings, Outcome};
use crate::dispatch::Dispatcher;

pub const AGENT_ID: &str = "collaborative";

/// Dispatch the same event to every agent concurrently, each branch with its
/// own copy of `state`, and join the results.
///
/// Successful branch states are merged onto the input state in agent-name
/// order. The run fails with a [`MultiError`] when every branch failed or
/// the failure ratio exceeds `failure_threshold`; otherwise the rendered
/// `MultiError` becomes the soft error of the merged result.
pub async fn run(
    dispatcher: &Dispatcher,
    ctx: &RunContext,
    event: &Event,
    state: State,
    agents: &[String],
    settings: &ModeSettings,
) -> Outcome {
    if agents.is_empty() {
        return Err(Failure::new(
            AGENT_ID,
            WeaveError::InvalidWorkflow("collaborative plan has no agents".into()),
        ));
    }

    let start = Utc::now();
    let branches = stream::iter(agents.iter().cloned())
        .map(|name| {
            let branch_state = state.clone();
            async move {
                let outcome = dispatcher.invoke(&name, ctx, event, branch_state).await;
                (name, outcome)
            }
        })
        .buffer_unordered(settings.max_concurrency.max(1))
        .collect::<Vec<_>>();

    let mut outcomes = match tokio::time::timeout(settings.timeout, branches).await {
        Ok(outcomes) => outcomes,
        Err(_) => {
            warn!(agents = agents.len(), "Collaborative fan-out timed out");
            return Err(Failure::new(
                AGENT_ID,
                WeaveError::Timeout(settings.timeout.as_millis() as u64),
            ));
        }
    };
    outcomes.sort_by(|(a, _), (b, _)| a.cmp(b));

    let total = outcomes.len();
    let mut merged = state;
    let mut failures = MultiError::new();
    let mut soft_errors = Vec::new();

    for (name, outcome) in outcomes {
        match outcome {
            Ok(result) => {
                if let Some(soft) = result.error {
                    soft_errors.push(format!("{}: {}", name, soft));
                }
                merged.merge(&result.output_state);
            }
            Err(e) => failures.push(WeaveError::stage(AGENT_ID, name, e)),
        }
    }

    let failed = failures.len();
    let ratio = failed as f64 / total as f64;
    debug!(total, failed, "Collaborative fan-out joined");

    if failed == total || ratio > settings.failure_threshold {
        return Err(Failure::new(AGENT_ID, WeaveError::Multi(failures)));
    }
    if !failures.is_empty() {
        warn!(failed, total, error = %failures, "Collaborative fan-out partially failed");
        soft_errors.insert(0, failures.to_string());
    }

    let mut result = AgentResult::new(merged).stamped(start, Utc::now());
    result.error = join_soft_errors(&soft_errors);
    Ok(Dispatched {
        agent_id: AGENT_ID.to_string(),
        result,
    })
}
