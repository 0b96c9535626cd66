use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use weave_core::error::Result;
use weave_core::hooks::{CallbackArgs, CallbackRegistry, HookPoint};
use weave_core::types::{AgentResult, State};

/// Callback id used for the trace hooks.
pub const TRACE_CALLBACK_ID: &str = "trace";

/// One recorded hook invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub hook: HookPoint,
    pub event_id: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_agent_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source_agent_id: String,
    pub state: State,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<AgentResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceEntry {
    fn from_args(session_id: &str, args: &CallbackArgs) -> Self {
        Self {
            timestamp: Utc::now(),
            hook: args.hook,
            event_id: args.event.id().to_string(),
            session_id: session_id.to_string(),
            agent_id: args.agent_id.clone(),
            target_agent_id: args.event.target_agent_id().to_string(),
            source_agent_id: args.event.source_agent_id().to_string(),
            state: args.state.clone(),
            agent_result: args.agent_result.clone(),
            error: args.error.clone(),
        }
    }
}

/// Sink for trace entries, grouped by session.
pub trait TraceLogger: Send + Sync + 'static {
    fn record(&self, entry: TraceEntry);
    /// Entries of one session in recording order.
    fn trace(&self, session_id: &str) -> Vec<TraceEntry>;
}

/// Keeps every entry in memory for the lifetime of the runner.
#[derive(Default)]
pub struct InMemoryTraceLogger {
    sessions: Mutex<HashMap<String, Vec<TraceEntry>>>,
}

impl InMemoryTraceLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions with at least one entry, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}

impl TraceLogger for InMemoryTraceLogger {
    fn record(&self, entry: TraceEntry) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.entry(entry.session_id.clone()).or_default().push(entry);
    }

    fn trace(&self, session_id: &str) -> Vec<TraceEntry> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).cloned().unwrap_or_default()
    }
}

/// Record every hook invocation into `logger`.
pub fn register_trace_hooks(
    callbacks: &CallbackRegistry,
    logger: Arc<dyn TraceLogger>,
) -> Result<()> {
    callbacks.register(HookPoint::All, TRACE_CALLBACK_ID, move |ctx, args: CallbackArgs| {
        logger.record(TraceEntry::from_args(ctx.session_id(), &args));
        async { Ok(None) }
    })
}
