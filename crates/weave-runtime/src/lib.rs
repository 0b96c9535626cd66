pub mod dispatch;
pub mod graph;
pub mod orchestration;
pub mod registry;
pub mod runner;
pub mod trace;

pub use dispatch::Dispatcher;
pub use graph::{
    AgentNode, EdgeKind, GraphEdge, IssueKind, NodeKind, ValidationError, ValidationResult,
    ValidationWarning, ValidatorLimits, WorkflowGraph, WorkflowValidator,
};
pub use orchestration::{LoopOutcome, ModeSettings, Orchestration, Orchestrator, Stage};
pub use registry::AgentRegistry;
pub use runner::{Runner, RunnerBuilder};
pub use trace::{InMemoryTraceLogger, TraceEntry, TraceLogger};
