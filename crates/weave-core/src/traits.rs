use std::future::Future;

use futures::future::BoxFuture;

use crate::context::RunContext;
use crate::error::Result;
use crate::types::{AgentResult, Event, State};

/// Agent handler: the single pluggable unit of work.
///
/// Handlers may be invoked concurrently with different `State` clones, so any
/// internal mutable state must be synchronized by the handler itself.
/// An `Err` return is a hard failure routed to the error router; a soft,
/// business-level failure goes in `AgentResult::error` instead.
pub trait AgentHandler: Send + Sync + 'static {
    fn run(&self, ctx: RunContext, event: Event, state: State)
        -> BoxFuture<'_, Result<AgentResult>>;
}

/// Adapter turning an async closure into an [`AgentHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> AgentHandler for FnHandler<F>
where
    F: Fn(RunContext, Event, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResult>> + Send + 'static,
{
    fn run(
        &self,
        ctx: RunContext,
        event: Event,
        state: State,
    ) -> BoxFuture<'_, Result<AgentResult>> {
        Box::pin((self.f)(ctx, event, state))
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(RunContext, Event, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<AgentResult>> + Send + 'static,
{
    FnHandler { f }
}
