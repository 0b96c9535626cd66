use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::RunContext;
use crate::error::{Result, WeaveError};
use crate::types::{AgentResult, Event, State};

/// Points in event processing where observers are invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookPoint {
    BeforeEventHandling,
    AfterEventHandling,
    BeforeAgentRun,
    AfterAgentRun,
    AgentError,
    /// Callbacks registered here run on every other hook point.
    All,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeEventHandling => "BeforeEventHandling",
            HookPoint::AfterEventHandling => "AfterEventHandling",
            HookPoint::BeforeAgentRun => "BeforeAgentRun",
            HookPoint::AfterAgentRun => "AfterAgentRun",
            HookPoint::AgentError => "AgentError",
            HookPoint::All => "All",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a callback gets to look at.
#[derive(Debug, Clone)]
pub struct CallbackArgs {
    pub hook: HookPoint,
    pub event: Event,
    pub state: State,
    pub agent_id: String,
    pub agent_result: Option<AgentResult>,
    pub error: Option<String>,
}

impl CallbackArgs {
    pub fn new(hook: HookPoint, event: Event, state: State) -> Self {
        Self {
            hook,
            event,
            state,
            agent_id: String::new(),
            agent_result: None,
            error: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_result(mut self, result: AgentResult) -> Self {
        self.agent_result = Some(result);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Observer callback. Returning `Some(state)` replaces the state handed to
/// the next callback and, ultimately, back to the runner.
pub type CallbackFn =
    Arc<dyn Fn(RunContext, CallbackArgs) -> BoxFuture<'static, Result<Option<State>>> + Send + Sync>;

/// Registry of observer callbacks keyed by hook point.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<HashMap<HookPoint, Vec<(String, CallbackFn)>>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `f` under `id` for `hook`. Ids are unique per hook point.
    pub fn register<F, Fut>(&self, hook: HookPoint, id: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(RunContext, CallbackArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<State>>> + Send + 'static,
    {
        let id = id.into();
        if id.is_empty() {
            return Err(WeaveError::Callback {
                hook: hook.to_string(),
                message: "callback id must not be empty".into(),
            });
        }

        let callback: CallbackFn = Arc::new(
            move |ctx: RunContext, args: CallbackArgs| -> BoxFuture<'static, Result<Option<State>>> {
                Box::pin(f(ctx, args))
            },
        );
        let mut map = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let entries = map.entry(hook).or_default();
        if entries.iter().any(|(existing, _)| *existing == id) {
            return Err(WeaveError::DuplicateCallback {
                hook: hook.to_string(),
                id,
            });
        }
        debug!(hook = %hook, id = %id, "Registered callback");
        entries.push((id, callback));
        Ok(())
    }

    /// Remove a callback. Returns false (and warns) when it was not registered.
    pub fn unregister(&self, hook: HookPoint, id: &str) -> bool {
        let mut map = self.callbacks.write().unwrap_or_else(|e| e.into_inner());
        let removed = map
            .get_mut(&hook)
            .and_then(|entries| {
                let pos = entries.iter().position(|(existing, _)| existing == id)?;
                Some(entries.remove(pos))
            })
            .is_some();
        if !removed {
            warn!(hook = %hook, id = %id, "Callback not found for unregister");
        }
        removed
    }

    /// Number of callbacks registered directly on `hook`.
    pub fn len(&self, hook: HookPoint) -> usize {
        let map = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        map.get(&hook).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        let map = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        map.values().all(Vec::is_empty)
    }

    fn snapshot(&self, hook: HookPoint) -> Vec<(String, CallbackFn)> {
        let map = self.callbacks.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<(String, CallbackFn)> = map.get(&hook).cloned().unwrap_or_default();
        if hook != HookPoint::All {
            if let Some(all) = map.get(&HookPoint::All) {
                list.extend(all.iter().cloned());
            }
        }
        list
    }

    /// Run every callback for `args.hook` (then the `All` callbacks), threading
    /// the state through them in registration order.
    ///
    /// All callbacks run even if one fails; the last failure is returned.
    pub async fn invoke(&self, ctx: &RunContext, args: CallbackArgs) -> Result<State> {
        let hook = args.hook;
        let callbacks = self.snapshot(hook);
        let mut state = args.state.clone();
        let mut last_err = None;

        for (id, callback) in callbacks {
            let mut call_args = args.clone();
            call_args.state = state.clone();
            match callback(ctx.clone(), call_args).await {
                Ok(Some(next)) => state = next,
                Ok(None) => {}
                Err(e) => {
                    warn!(hook = %hook, id = %id, error = %e, "Callback failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(state),
        }
    }
}
