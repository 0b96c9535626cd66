//! Static workflow validation.
//!
//! Three entry points share the same result type: a flat agent list with a
//! composition mode, a set of registered agents with an orchestration plan,
//! and a declared [`WorkflowGraph`]. Validation is a pure function of its
//! input.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use weave_core::config::OrchestrationMode;
use weave_core::failure::Severity;

use super::{NodeKind, WorkflowGraph};
use crate::orchestration::{Orchestration, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueKind {
    EmptyComposition,
    EmptyOrchestration,
    EmptyGraph,
    DuplicateAgentName,
    EmptyAgentName,
    NoEntryPoint,
    NoEndpoint,
    MissingAgent,
    CircularDependency,
    UnreachableNode,
    DisconnectedGraph,
    MultipleDeadEnds,
    InvalidLoopAgentCount,
    InvalidRouting,
    HighParallelism,
    LongSequentialChain,
    InfiniteLoopRisk,
    SingleRouteTarget,
    MissingErrorHandler,
    InconsistentNaming,
    NamingConvention,
    SparseMixedComposition,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueKind::EmptyComposition => "EMPTY_COMPOSITION",
            IssueKind::EmptyOrchestration => "EMPTY_ORCHESTRATION",
            IssueKind::EmptyGraph => "EMPTY_GRAPH",
            IssueKind::DuplicateAgentName => "DUPLICATE_AGENT_NAME",
            IssueKind::EmptyAgentName => "EMPTY_AGENT_NAME",
            IssueKind::NoEntryPoint => "NO_ENTRY_POINT",
            IssueKind::NoEndpoint => "NO_ENDPOINT",
            IssueKind::MissingAgent => "MISSING_AGENT",
            IssueKind::CircularDependency => "CIRCULAR_DEPENDENCY",
            IssueKind::UnreachableNode => "UNREACHABLE_NODE",
            IssueKind::DisconnectedGraph => "DISCONNECTED_GRAPH",
            IssueKind::MultipleDeadEnds => "MULTIPLE_DEAD_ENDS",
            IssueKind::InvalidLoopAgentCount => "INVALID_LOOP_AGENT_COUNT",
            IssueKind::InvalidRouting => "INVALID_ROUTING",
            IssueKind::HighParallelism => "HIGH_PARALLELISM",
            IssueKind::LongSequentialChain => "LONG_SEQUENTIAL_CHAIN",
            IssueKind::InfiniteLoopRisk => "INFINITE_LOOP_RISK",
            IssueKind::SingleRouteTarget => "SINGLE_ROUTE_TARGET",
            IssueKind::MissingErrorHandler => "MISSING_ERROR_HANDLER",
            IssueKind::InconsistentNaming => "INCONSISTENT_NAMING",
            IssueKind::NamingConvention => "NAMING_CONVENTION",
            IssueKind::SparseMixedComposition => "SPARSE_MIXED_COMPOSITION",
        }
    }
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub kind: IssueKind,
    pub message: String,
    pub severity: Severity,
    pub component: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
}

impl ValidationError {
    fn new(kind: IssueKind, severity: Severity, component: &str, message: String) -> Self {
        Self {
            kind,
            message,
            severity,
            component: component.to_string(),
            suggestions: Vec::new(),
            details: BTreeMap::new(),
        }
    }

    fn suggest(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.component, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationWarning {
    pub kind: IssueKind,
    pub message: String,
    pub component: String,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.kind, self.component, self.message)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationResult {
    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|e| e.kind == kind)
    }

    pub fn has_warning(&self, kind: IssueKind) -> bool {
        self.warnings.iter().any(|w| w.kind == kind)
    }

    /// Every error, rendered and joined with `; `.
    pub fn render_errors(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    fn warn(&mut self, kind: IssueKind, component: &str, message: String) {
        self.warnings.push(ValidationWarning {
            kind,
            message,
            component: component.to_string(),
        });
    }

    fn finish(mut self) -> Self {
        self.is_valid = self.errors.is_empty();
        self
    }
}

/// Thresholds for the advisory checks.
#[derive(Debug, Clone)]
pub struct ValidatorLimits {
    /// Parallel groups larger than this get a warning.
    pub max_parallel: usize,
    /// Sequences longer than this get a warning.
    pub max_sequential: usize,
    /// Error handlers with outgoing routes are errors instead of allowed.
    pub strict: bool,
    /// Name of the default recovery handler.
    pub error_handler_name: String,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            max_sequential: 5,
            strict: false,
            error_handler_name: "error-handler".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowValidator {
    limits: ValidatorLimits,
}

impl WorkflowValidator {
    pub fn new(limits: ValidatorLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidatorLimits {
        &self.limits
    }

    /// Check a flat agent list meant to run under `mode`.
    pub fn validate_composition<S: AsRef<str>>(
        &self,
        agents: &[S],
        mode: OrchestrationMode,
    ) -> ValidationResult {
        const COMPONENT: &str = "Composition";
        let mut result = ValidationResult::default();
        let names: Vec<&str> = agents.iter().map(AsRef::as_ref).collect();

        if names.is_empty() {
            result.error(
                ValidationError::new(
                    IssueKind::EmptyComposition,
                    Severity::Critical,
                    COMPONENT,
                    "Composition must contain at least one agent".into(),
                )
                .suggest("Add at least one agent to the composition"),
            );
            return result.finish();
        }

        self.check_names(&names, COMPONENT, &mut result);

        let count = names.len();
        match mode {
            OrchestrationMode::Collaborative => self.check_parallel(count, COMPONENT, &mut result),
            OrchestrationMode::Sequential => self.check_sequential(count, COMPONENT, &mut result),
            OrchestrationMode::Loop => {
                if count != 1 {
                    result.error(
                        ValidationError::new(
                            IssueKind::InvalidLoopAgentCount,
                            Severity::High,
                            COMPONENT,
                            format!("Loop composition must have exactly 1 agent, found {}", count),
                        )
                        .suggest("Use a single agent for loop execution"),
                    );
                }
                result.warn(
                    IssueKind::InfiniteLoopRisk,
                    COMPONENT,
                    "Loop composition may run indefinitely without a termination condition".into(),
                );
            }
            OrchestrationMode::Route => {
                if count == 1 {
                    result.warn(
                        IssueKind::SingleRouteTarget,
                        COMPONENT,
                        "Only one agent in routing mode; consider direct execution".into(),
                    );
                }
            }
            OrchestrationMode::Mixed => {
                if count < 2 {
                    result.warn(
                        IssueKind::SparseMixedComposition,
                        COMPONENT,
                        "Mixed orchestration typically needs several agents".into(),
                    );
                }
            }
        }

        result.finish()
    }

    /// Check an orchestration plan against the agents actually registered.
    pub fn validate_orchestration<S: AsRef<str>>(
        &self,
        registered: &[S],
        plan: &Orchestration,
    ) -> ValidationResult {
        const COMPONENT: &str = "Orchestration";
        let mut result = ValidationResult::default();
        let names: Vec<&str> = registered.iter().map(AsRef::as_ref).collect();

        if names.is_empty() {
            result.error(
                ValidationError::new(
                    IssueKind::EmptyOrchestration,
                    Severity::Critical,
                    COMPONENT,
                    "Orchestration must contain at least one agent handler".into(),
                )
                .suggest("Register at least one agent before starting"),
            );
            return result.finish();
        }

        self.check_names(&names, COMPONENT, &mut result);

        let known: HashSet<&str> = names.iter().copied().collect();
        for agent in plan.referenced_agents() {
            if !known.contains(agent) {
                result.error(
                    ValidationError::new(
                        IssueKind::MissingAgent,
                        Severity::High,
                        COMPONENT,
                        format!("Agent '{}' is referenced by the {} plan but not registered", agent, plan.mode()),
                    )
                    .suggest(format!("Register a handler named '{}'", agent))
                    .detail("agent", agent),
                );
            }
        }

        match plan {
            Orchestration::Route => {
                if names.len() == 1 {
                    result.warn(
                        IssueKind::SingleRouteTarget,
                        COMPONENT,
                        "Only one agent in routing mode; consider direct execution".into(),
                    );
                }
            }
            Orchestration::Sequential { agents } => {
                let count = if agents.is_empty() { names.len() } else { agents.len() };
                self.check_sequential(count, COMPONENT, &mut result);
            }
            Orchestration::Collaborative { agents } => {
                let count = if agents.is_empty() { names.len() } else { agents.len() };
                self.check_parallel(count, COMPONENT, &mut result);
            }
            Orchestration::Loop { agent, .. } => {
                if agent.is_empty() {
                    result.error(ValidationError::new(
                        IssueKind::InvalidLoopAgentCount,
                        Severity::High,
                        COMPONENT,
                        "Loop orchestration requires exactly 1 agent, found 0".into(),
                    ));
                }
            }
            Orchestration::Mixed { stages } => {
                if stages.is_empty() {
                    result.error(
                        ValidationError::new(
                            IssueKind::EmptyComposition,
                            Severity::High,
                            COMPONENT,
                            "Mixed orchestration has no stages".into(),
                        )
                        .suggest("Configure collaborators and/or a sequence"),
                    );
                }
                for stage in stages {
                    match stage {
                        Stage::Parallel(group) => {
                            let count = if group.is_empty() { names.len() } else { group.len() };
                            self.check_parallel(count, COMPONENT, &mut result);
                        }
                        Stage::Loop { agent, .. } if agent.is_empty() => {
                            result.error(ValidationError::new(
                                IssueKind::InvalidLoopAgentCount,
                                Severity::High,
                                COMPONENT,
                                "Loop stage requires exactly 1 agent, found 0".into(),
                            ));
                        }
                        _ => {}
                    }
                }
                if plan.referenced_agents().len() < 2 {
                    result.warn(
                        IssueKind::SparseMixedComposition,
                        COMPONENT,
                        "Mixed orchestration typically needs several agents".into(),
                    );
                }
            }
        }

        if !known.contains(self.limits.error_handler_name.as_str()) {
            result.warn(
                IssueKind::MissingErrorHandler,
                COMPONENT,
                format!(
                    "No '{}' agent registered; unroutable failures will only be logged",
                    self.limits.error_handler_name
                ),
            );
        }

        result.finish()
    }

    /// Structural checks over a declared graph.
    pub fn validate_graph(&self, graph: &WorkflowGraph) -> ValidationResult {
        const COMPONENT: &str = "WorkflowGraph";
        let mut result = ValidationResult::default();

        if graph.nodes.is_empty() {
            result.error(
                ValidationError::new(
                    IssueKind::EmptyGraph,
                    Severity::Critical,
                    COMPONENT,
                    "Workflow graph has no nodes".into(),
                )
                .suggest("Declare at least one node"),
            );
            return result.finish();
        }

        // Naming.
        let mut seen_names: HashMap<&str, &str> = HashMap::new();
        for (key, node) in &graph.nodes {
            if node.name.is_empty() || key.is_empty() {
                result.error(ValidationError::new(
                    IssueKind::EmptyAgentName,
                    Severity::High,
                    COMPONENT,
                    format!("Node '{}' has an empty name", key),
                ));
                continue;
            }
            if *key != node.name {
                result.warn(
                    IssueKind::InconsistentNaming,
                    COMPONENT,
                    format!("Node key '{}' doesn't match node name '{}'", key, node.name),
                );
            }
            if let Some(first) = seen_names.insert(node.name.as_str(), key.as_str()) {
                result.error(
                    ValidationError::new(
                        IssueKind::DuplicateAgentName,
                        Severity::High,
                        COMPONENT,
                        format!("Duplicate agent name '{}' (nodes '{}' and '{}')", node.name, first, key),
                    )
                    .detail("agent", node.name.clone()),
                );
            }
            if has_whitespace(key) {
                result.warn(
                    IssueKind::NamingConvention,
                    COMPONENT,
                    format!("Agent name '{}' contains whitespace", key),
                );
            }
        }

        // Entry points and endpoints.
        let entries = graph.entry_points();
        if entries.is_empty() {
            result.error(
                ValidationError::new(
                    IssueKind::NoEntryPoint,
                    Severity::High,
                    COMPONENT,
                    "No entry point defined in workflow graph".into(),
                )
                .suggest("Mark at least one node with is_entry_point = true"),
            );
        }
        if !graph.nodes.values().any(|n| n.is_endpoint) {
            result.warn(
                IssueKind::NoEndpoint,
                COMPONENT,
                "No explicit endpoint defined in workflow graph".into(),
            );
        }

        // Edge integrity; only edges between known nodes feed the graph checks.
        let mut adjacency: BTreeMap<&str, Vec<&str>> =
            graph.nodes.keys().map(|k| (k.as_str(), Vec::new())).collect();
        let effective = graph.effective_edges();
        for edge in &effective {
            let mut intact = true;
            for (end, name) in [("from", &edge.from), ("to", &edge.to)] {
                if !graph.nodes.contains_key(name) {
                    intact = false;
                    result.error(
                        ValidationError::new(
                            IssueKind::MissingAgent,
                            Severity::High,
                            COMPONENT,
                            format!("Edge references non-existent '{}' node: {}", end, name),
                        )
                        .detail("from", edge.from.clone())
                        .detail("to", edge.to.clone()),
                    );
                }
            }
            if intact {
                if let Some(out) = adjacency.get_mut(edge.from.as_str()) {
                    out.push(edge.to.as_str());
                }
            }
        }

        for cycle in find_cycles(&adjacency) {
            let path = cycle.join(" -> ");
            let from = cycle[cycle.len() - 2];
            let to = cycle[cycle.len() - 1];
            result.error(
                ValidationError::new(
                    IssueKind::CircularDependency,
                    Severity::Critical,
                    COMPONENT,
                    format!("Circular dependency detected: {}", path),
                )
                .suggest("Remove one edge of the cycle or turn it into a loop orchestration")
                .detail("from", from)
                .detail("to", to)
                .detail("path", path.clone()),
            );
        }

        if !entries.is_empty() {
            let reachable = reachable_from(&adjacency, &entries);
            for name in adjacency.keys().filter(|n| !reachable.contains(*n)) {
                result.warn(
                    IssueKind::UnreachableNode,
                    COMPONENT,
                    format!("Node '{}' is not reachable from any entry point", name),
                );
            }
        }

        let components = count_components(&adjacency);
        if components > 1 {
            result.error(
                ValidationError::new(
                    IssueKind::DisconnectedGraph,
                    Severity::High,
                    COMPONENT,
                    format!("Workflow graph is split into {} disconnected parts", components),
                )
                .suggest("Connect every node to the rest of the workflow")
                .detail("components", components.to_string()),
            );
        }

        let dead_ends: Vec<&str> = adjacency
            .iter()
            .filter(|(_, out)| out.is_empty())
            .map(|(name, _)| *name)
            .collect();
        if dead_ends.len() > 1 {
            result.warn(
                IssueKind::MultipleDeadEnds,
                COMPONENT,
                format!("Found multiple dead-end nodes: {}", dead_ends.join(", ")),
            );
        }

        // Role-specific routing rules.
        for (key, node) in &graph.nodes {
            let routes_out = adjacency.get(key.as_str()).map_or(false, |out| !out.is_empty());
            match node.kind {
                NodeKind::Finalizer if routes_out => {
                    result.error(
                        ValidationError::new(
                            IssueKind::InvalidRouting,
                            Severity::High,
                            COMPONENT,
                            format!("Finalizer '{}' must not route to other nodes", key),
                        )
                        .detail("agent", key.clone()),
                    );
                }
                NodeKind::ErrorHandler if routes_out && self.limits.strict => {
                    result.error(
                        ValidationError::new(
                            IssueKind::InvalidRouting,
                            Severity::Medium,
                            COMPONENT,
                            format!("Error handler '{}' routes to other nodes", key),
                        )
                        .detail("agent", key.clone()),
                    );
                }
                _ => {}
            }
        }

        let has_handler = graph.nodes.iter().any(|(key, node)| {
            node.kind == NodeKind::ErrorHandler || *key == self.limits.error_handler_name
        });
        if !has_handler {
            result.warn(
                IssueKind::MissingErrorHandler,
                COMPONENT,
                "No error handler node declared".into(),
            );
        }

        result.finish()
    }

    fn check_names(&self, names: &[&str], component: &str, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for (index, name) in names.iter().enumerate() {
            if name.is_empty() {
                result.error(ValidationError::new(
                    IssueKind::EmptyAgentName,
                    Severity::High,
                    component,
                    format!("Agent at position {} has an empty name", index),
                ));
                continue;
            }
            if !seen.insert(*name) {
                result.error(
                    ValidationError::new(
                        IssueKind::DuplicateAgentName,
                        Severity::High,
                        component,
                        format!("Duplicate agent name: {}", name),
                    )
                    .detail("agent", *name),
                );
            }
            if has_whitespace(name) {
                result.warn(
                    IssueKind::NamingConvention,
                    component,
                    format!("Agent name '{}' contains whitespace", name),
                );
            }
        }
    }

    fn check_parallel(&self, count: usize, component: &str, result: &mut ValidationResult) {
        if count > self.limits.max_parallel {
            result.warn(
                IssueKind::HighParallelism,
                component,
                format!("High number of parallel agents ({}) may impact performance", count),
            );
        }
    }

    fn check_sequential(&self, count: usize, component: &str, result: &mut ValidationResult) {
        if count > self.limits.max_sequential {
            result.warn(
                IssueKind::LongSequentialChain,
                component,
                format!("Long sequential chain ({} agents) may have high latency", count),
            );
        }
    }
}

fn has_whitespace(name: &str) -> bool {
    static WHITESPACE: OnceLock<Option<Regex>> = OnceLock::new();
    WHITESPACE
        .get_or_init(|| Regex::new(r"\s").ok())
        .as_ref()
        .map_or_else(|| name.chars().any(char::is_whitespace), |re| re.is_match(name))
}

/// Every back edge found by a depth-first search, as the node path from the
/// back edge's target around to itself (`[A, B, A]`).
fn find_cycles<'a>(adjacency: &BTreeMap<&'a str, Vec<&'a str>>) -> Vec<Vec<&'a str>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Fresh,
        /// Position on the current path.
        OnStack(usize),
        Done,
    }

    let mut marks: HashMap<&'a str, Mark> = HashMap::new();
    let mut cycles = Vec::new();

    for &root in adjacency.keys() {
        if marks.get(root).copied().unwrap_or(Mark::Fresh) != Mark::Fresh {
            continue;
        }
        // (node, index of its next successor to look at)
        let mut frames: Vec<(&'a str, usize)> = vec![(root, 0)];
        let mut path: Vec<&'a str> = vec![root];
        marks.insert(root, Mark::OnStack(0));

        while let Some(frame) = frames.last_mut() {
            let (node, cursor) = *frame;
            let Some(next) = adjacency.get(node).and_then(|succ| succ.get(cursor)).copied() else {
                frames.pop();
                path.pop();
                marks.insert(node, Mark::Done);
                continue;
            };
            frame.1 += 1;

            match marks.get(next).copied().unwrap_or(Mark::Fresh) {
                Mark::Fresh => {
                    marks.insert(next, Mark::OnStack(path.len()));
                    path.push(next);
                    frames.push((next, 0));
                }
                Mark::OnStack(pos) => {
                    let mut cycle = path[pos..].to_vec();
                    cycle.push(next);
                    cycles.push(cycle);
                }
                Mark::Done => {}
            }
        }
    }
    cycles
}

fn reachable_from<'a>(
    adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
    entries: &[&'a str],
) -> BTreeSet<&'a str> {
    let mut seen: BTreeSet<&str> = entries.iter().copied().collect();
    let mut queue: VecDeque<&str> = entries.iter().copied().collect();
    while let Some(node) = queue.pop_front() {
        for &next in adjacency.get(node).map(Vec::as_slice).unwrap_or_default() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Connected components of the graph with edge direction ignored.
fn count_components(adjacency: &BTreeMap<&str, Vec<&str>>) -> usize {
    let mut undirected: HashMap<&str, Vec<&str>> = HashMap::new();
    for (&from, out) in adjacency {
        undirected.entry(from).or_default();
        for &to in out {
            undirected.entry(from).or_default().push(to);
            undirected.entry(to).or_default().push(from);
        }
    }

    let mut seen = HashSet::new();
    let mut components = 0;
    for &start in adjacency.keys() {
        if !seen.insert(start) {
            continue;
        }
        components += 1;
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for &next in undirected.get(node).map(Vec::as_slice).unwrap_or_default() {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
    }
    components
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AgentNode, GraphEdge};

    fn chain(names: &[&str]) -> WorkflowGraph {
        let mut graph = WorkflowGraph::new();
        for (i, name) in names.iter().enumerate() {
            let mut node = AgentNode::new(*name);
            if i == 0 {
                node = node.entry();
            }
            if i == names.len() - 1 {
                node = node.endpoint();
            }
            graph.add_node(node);
        }
        for pair in names.windows(2) {
            graph.add_edge(GraphEdge::flow(pair[0], pair[1]));
        }
        graph
    }

    #[test]
    fn test_two_node_cycle() {
        let graph = chain(&["A", "B"]).with_edge("B", "A");
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(!result.is_valid);
        let cycle = result
            .errors
            .iter()
            .find(|e| e.kind == IssueKind::CircularDependency)
            .unwrap();
        assert_eq!(cycle.details.get("path").map(String::as_str), Some("A -> B -> A"));
        assert_eq!(cycle.severity, Severity::Critical);
    }

    #[test]
    fn test_cycle_search_handles_long_chains() {
        let names: Vec<String> = (0..100_000).map(|i| format!("n{i:06}")).collect();
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for pair in names.windows(2) {
            adjacency.insert(pair[0].as_str(), vec![pair[1].as_str()]);
        }
        assert!(find_cycles(&adjacency).is_empty());

        adjacency.insert(names[names.len() - 1].as_str(), vec![names[0].as_str()]);
        let cycles = find_cycles(&adjacency);
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].len(), names.len() + 1);
        assert_eq!(cycles[0].first(), Some(&"n000000"));
        assert_eq!(cycles[0].last(), Some(&"n000000"));
    }

    #[test]
    fn test_cycle_paths_start_at_back_edge_target() {
        let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        adjacency.insert("A", vec!["B"]);
        adjacency.insert("B", vec!["C", "D"]);
        adjacency.insert("C", vec!["B"]);
        adjacency.insert("D", vec!["A"]);
        assert_eq!(
            find_cycles(&adjacency),
            vec![vec!["B", "C", "B"], vec!["A", "B", "D", "A"]]
        );
    }

    #[test]
    fn test_linear_chain_is_valid() {
        let result = WorkflowValidator::default().validate_graph(&chain(&["A", "B", "C"]));
        assert!(result.is_valid, "{}", result.render_errors());
        assert!(!result.has_error(IssueKind::CircularDependency));
        assert!(!result.has_warning(IssueKind::MultipleDeadEnds));
    }

    #[test]
    fn test_isolated_node() {
        let graph = chain(&["A", "B"]).with_node(AgentNode::new("C"));
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(!result.is_valid);
        assert!(result.has_error(IssueKind::DisconnectedGraph));
        let unreachable: Vec<&str> = result
            .warnings
            .iter()
            .filter(|w| w.kind == IssueKind::UnreachableNode)
            .map(|w| w.message.as_str())
            .collect();
        assert_eq!(unreachable, vec!["Node 'C' is not reachable from any entry point"]);
        assert!(result.has_warning(IssueKind::MultipleDeadEnds));
    }

    #[test]
    fn test_empty_graph_short_circuits() {
        let result = WorkflowValidator::default().validate_graph(&WorkflowGraph::new());
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, IssueKind::EmptyGraph);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_entry_and_bad_edge() {
        let graph = WorkflowGraph::new()
            .with_node(AgentNode::new("A"))
            .with_edge("A", "ghost");
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(result.has_error(IssueKind::NoEntryPoint));
        assert!(result.has_error(IssueKind::MissingAgent));
        assert!(result.has_warning(IssueKind::NoEndpoint));
        // Reachability needs entry points.
        assert!(!result.has_warning(IssueKind::UnreachableNode));
    }

    #[test]
    fn test_implied_edges_count() {
        let graph = WorkflowGraph::new()
            .with_node(AgentNode::new("plan").entry().routes_to("write"))
            .with_node(AgentNode::new("write").endpoint().depends_on("plan"));
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(result.is_valid, "{}", result.render_errors());
    }

    #[test]
    fn test_routing_rules_by_kind() {
        let graph = chain(&["start", "fin", "end"]);
        let mut graph = graph;
        if let Some(node) = graph.nodes.get_mut("fin") {
            node.kind = NodeKind::Finalizer;
        }
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(result.has_error(IssueKind::InvalidRouting));

        let graph = chain(&["start", "recover", "end"]);
        let mut graph = graph;
        if let Some(node) = graph.nodes.get_mut("recover") {
            node.kind = NodeKind::ErrorHandler;
        }
        let lenient = WorkflowValidator::default().validate_graph(&graph);
        assert!(!lenient.has_error(IssueKind::InvalidRouting));
        let strict = WorkflowValidator::new(ValidatorLimits {
            strict: true,
            ..ValidatorLimits::default()
        })
        .validate_graph(&graph);
        assert!(strict.has_error(IssueKind::InvalidRouting));
    }

    #[test]
    fn test_naming_checks() {
        let mut graph = chain(&["A", "B"]);
        graph.nodes.insert("alias".into(), AgentNode::new("A").endpoint());
        graph.add_edge(GraphEdge::flow("B", "alias"));
        let result = WorkflowValidator::default().validate_graph(&graph);
        assert!(result.has_error(IssueKind::DuplicateAgentName));
        assert!(result.has_warning(IssueKind::InconsistentNaming));
    }

    #[test]
    fn test_composition_checks() {
        let v = WorkflowValidator::default();
        let empty: [&str; 0] = [];
        let result = v.validate_composition(&empty, OrchestrationMode::Sequential);
        assert!(result.has_error(IssueKind::EmptyComposition));

        let result = v.validate_composition(&["a", "b"], OrchestrationMode::Loop);
        assert!(result.has_error(IssueKind::InvalidLoopAgentCount));
        assert!(result.has_warning(IssueKind::InfiniteLoopRisk));

        let result = v.validate_composition(&["a", "a", "my agent"], OrchestrationMode::Collaborative);
        assert!(result.has_error(IssueKind::DuplicateAgentName));
        assert!(result.has_warning(IssueKind::NamingConvention));

        let many: Vec<String> = (0..6).map(|i| format!("step-{}", i)).collect();
        let result = v.validate_composition(&many, OrchestrationMode::Sequential);
        assert!(result.is_valid);
        assert!(result.has_warning(IssueKind::LongSequentialChain));

        let wide: Vec<String> = (0..11).map(|i| format!("w{}", i)).collect();
        let result = v.validate_composition(&wide, OrchestrationMode::Collaborative);
        assert!(result.has_warning(IssueKind::HighParallelism));
    }

    #[test]
    fn test_orchestration_checks() {
        let v = WorkflowValidator::default();
        let none: [&str; 0] = [];
        assert!(v
            .validate_orchestration(&none, &Orchestration::Route)
            .has_error(IssueKind::EmptyOrchestration));

        let plan = Orchestration::Sequential {
            agents: vec!["a".into(), "ghost".into()],
        };
        let result = v.validate_orchestration(&["a", "error-handler"], &plan);
        assert!(!result.is_valid);
        assert!(result.has_error(IssueKind::MissingAgent));
        assert!(!result.has_warning(IssueKind::MissingErrorHandler));

        let result = v.validate_orchestration(&["solo"], &Orchestration::Route);
        assert!(result.is_valid);
        assert!(result.has_warning(IssueKind::SingleRouteTarget));
        assert!(result.has_warning(IssueKind::MissingErrorHandler));

        let plan = Orchestration::Mixed { stages: vec![] };
        assert!(v
            .validate_orchestration(&["a"], &plan)
            .has_error(IssueKind::EmptyComposition));
    }

    #[test]
    fn test_issue_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&IssueKind::CircularDependency).unwrap(),
            "\"CIRCULAR_DEPENDENCY\""
        );
        assert_eq!(IssueKind::UnreachableNode.to_string(), "UNREACHABLE_NODE");
    }
}
