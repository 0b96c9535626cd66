use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload map carried by events and states.
pub type EventData = HashMap<String, serde_json::Value>;

/// Well-known metadata keys.
pub mod keys {
    pub const SESSION_ID: &str = "session_id";
    pub const ROUTE: &str = "route";
    pub const STATUS: &str = "status";
    pub const RETRY_COUNT: &str = "retry_count";
    pub const ERROR_CODE: &str = "error_code";
    pub const SEVERITY: &str = "severity";
    pub const RECOVERY_ACTION: &str = "recovery_action";
    pub const FAILED_AGENT_ID: &str = "failed_agent_id";
    pub const ROUTE_HOPS: &str = "route_hops";
    pub const LOOP_CONTINUE: &str = "loop_continue";
    pub const LOOP_COMPLETED: &str = "loop_completed";
    pub const LOOP_OUTCOME: &str = "loop_outcome";
    pub const LOOP_ITERATIONS: &str = "loop_iterations";

    pub const STATUS_SUCCESS: &str = "success";
    pub const STATUS_ERROR: &str = "error";
}

/// An immutable message routed between agents.
///
/// Fields are only reachable through accessors. Builders consume the value,
/// so an event that has been emitted is never changed in place; derivations
/// (`derive`, retries, error events) always produce a new `Event`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    data: EventData,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    source_agent_id: String,
    #[serde(default)]
    target_agent_id: String,
}

impl Event {
    pub fn new(
        target_agent_id: impl Into<String>,
        data: EventData,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            data,
            metadata,
            source_agent_id: String::new(),
            target_agent_id: target_agent_id.into(),
        }
    }

    /// Event for `target` with no payload.
    pub fn to(target_agent_id: impl Into<String>) -> Self {
        Self::new(target_agent_id, EventData::new(), HashMap::new())
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_agent_id = source.into();
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_session(self, session_id: impl Into<String>) -> Self {
        self.with_meta(keys::SESSION_ID, session_id)
    }

    /// A new event for `target` carrying a copy of this event's data and metadata.
    pub fn derive(&self, target_agent_id: impl Into<String>) -> Self {
        Self::new(target_agent_id, self.data.clone(), self.metadata.clone())
            .with_source(self.source_agent_id.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn session_id(&self) -> Option<&str> {
        self.get_meta(keys::SESSION_ID).filter(|s| !s.is_empty())
    }

    pub fn source_agent_id(&self) -> &str {
        &self.source_agent_id
    }

    pub fn target_agent_id(&self) -> &str {
        &self.target_agent_id
    }
}

/// Mutable, cloneable scratch space threaded through a causal chain.
///
/// `Clone` is a deep copy: values are owned `serde_json::Value`s, so a clone
/// shares nothing with its origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    data: EventData,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: EventData) -> Self {
        Self {
            data,
            metadata: HashMap::new(),
        }
    }

    /// Seed a state from an event: all data, and all metadata except `route`.
    ///
    /// A handler continues the chain only by setting `route` on its output.
    pub fn seeded_from(event: &Event) -> Self {
        let metadata = event
            .metadata()
            .iter()
            .filter(|(k, _)| k.as_str() != keys::ROUTE)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            data: event.data().clone(),
            metadata,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.data.remove(key)
    }

    pub fn get_meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<String> {
        self.metadata.remove(key)
    }

    /// Data keys, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.data.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Metadata keys, sorted.
    pub fn meta_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.metadata.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Copy every data and metadata entry of `other` into this state,
    /// overwriting existing keys.
    pub fn merge(&mut self, other: &State) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.metadata {
            self.metadata.insert(k.clone(), v.clone());
        }
    }

    pub fn into_parts(self) -> (EventData, HashMap<String, String>) {
        (self.data, self.metadata)
    }
}

/// Result of a single agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub output_state: State,
    /// Soft (business) failure. The workflow may continue past it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl AgentResult {
    pub fn new(output_state: State) -> Self {
        let now = Utc::now();
        Self {
            output_state,
            error: None,
            metadata: HashMap::new(),
            start_time: now,
            end_time: now,
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Record the wall-clock window of the invocation that produced this result.
    pub fn stamped(mut self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self.duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;
        self
    }

    /// Routing directive carried by the output state, if any.
    pub fn route(&self) -> Option<&str> {
        self.output_state
            .get_meta(keys::ROUTE)
            .filter(|r| !r.is_empty())
    }
}

/// Notifications published on the runtime's event bus.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    RunnerStarted {
        workers: usize,
    },
    RunnerStopped {
        processed: u64,
    },
    EventDispatched {
        event_id: String,
        session_id: String,
        target: String,
    },
    AgentCompleted {
        agent_id: String,
        event_id: String,
        elapsed_ms: u64,
    },
    AgentFailed {
        agent_id: String,
        event_id: String,
        error: String,
    },
    ErrorRouted {
        event_id: String,
        handler: String,
        error_code: String,
        severity: String,
        recovery_action: String,
    },
    ErrorUnhandled {
        event_id: String,
        agent_id: String,
        error: String,
    },
    RetryScheduled {
        event_id: String,
        target: String,
        retry_count: u32,
    },
    ChainTerminated {
        session_id: String,
        reason: String,
    },
    EventDropped {
        event_id: String,
        reason: String,
    },
    LoopFinished {
        agent_id: String,
        iterations: u32,
        condition_met: bool,
    },
    BreakerStateChanged {
        name: String,
        from: String,
        to: String,
    },
}
