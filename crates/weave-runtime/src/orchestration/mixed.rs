use chrono::Utc;
use tracing::debug;

use weave_core::context::RunContext;
use weave_core::error::WeaveError;
use weave_core::types::{AgentResult, Event, State};

use super::{join_soft_errors, looping, parallel, sequential, Dispatched, Failure, Orchestrator, Outcome, Stage};
use crate::dispatch::Dispatcher;

/// Run `stages` in order, each stage receiving the previous stage's state.
pub async fn run(
    dispatcher: &Dispatcher,
    ctx: &RunContext,
    event: &Event,
    state: State,
    stages: &[Stage],
    orchestrator: &Orchestrator,
) -> Outcome {
    if stages.is_empty() {
        return Err(Failure::new(
            "mixed",
            WeaveError::InvalidWorkflow("mixed plan has no stages".into()),
        ));
    }

    let start = Utc::now();
    let mut state = state;
    let mut soft_errors = Vec::new();
    let mut last_agent = String::new();
    let mut metadata = std::collections::HashMap::new();

    for (index, stage) in stages.iter().enumerate() {
        debug!(stage = index, "Running mixed stage");
        let out = match stage {
            Stage::Agent(agent) => {
                sequential::run(dispatcher, ctx, event, state, std::slice::from_ref(agent), "mixed")
                    .await?
            }
            Stage::Parallel(group) => {
                let group = orchestrator.resolve(dispatcher, group);
                parallel::run(dispatcher, ctx, event, state, &group, orchestrator.settings()).await?
            }
            Stage::Loop {
                agent,
                max_iterations,
            } => looping::run(dispatcher, ctx, event, state, agent, *max_iterations).await?,
        };

        let Dispatched { agent_id, result } = out;
        if let Some(soft) = result.error {
            soft_errors.push(soft);
        }
        metadata.extend(result.metadata);
        state = result.output_state;
        last_agent = agent_id;
    }

    let mut result = AgentResult::new(state).stamped(start, Utc::now());
    result.error = join_soft_errors(&soft_errors);
    result.metadata = metadata;
    Ok(Dispatched {
        agent_id: last_agent,
        result,
    })
}
