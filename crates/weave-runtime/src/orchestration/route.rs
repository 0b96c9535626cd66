use tracing::debug;

use weave_core::context::RunContext;
use weave_core::error::WeaveError;
use weave_core::types::{keys, Event, State};

use super::{Dispatched, Failure, Outcome};
use crate::dispatch::Dispatcher;

/// Handler an event is routed to: `route` metadata, else its target agent.
pub fn target_of(event: &Event) -> Option<&str> {
    event
        .get_meta(keys::ROUTE)
        .filter(|r| !r.is_empty())
        .or_else(|| Some(event.target_agent_id()).filter(|t| !t.is_empty()))
}

/// Dispatch `event` to the single handler it names.
pub async fn run(dispatcher: &Dispatcher, ctx: &RunContext, event: &Event, state: State) -> Outcome {
    let Some(target) = target_of(event) else {
        return Err(Failure::new("unknown", WeaveError::MissingRoute));
    };
    debug!(event_id = %event.id(), target = %target, "Routing event");

    match dispatcher.invoke(target, ctx, event, state).await {
        Ok(result) => Ok(Dispatched {
            agent_id: target.to_string(),
            result,
        }),
        Err(error) => Err(Failure::new(target, error)),
    }
}
