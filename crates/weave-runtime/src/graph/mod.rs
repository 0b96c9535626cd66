//! Workflow graphs and their static validation.
//!
//! A workflow is a set of named [`AgentNode`]s connected by [`GraphEdge`]s.
//! Graphs are declared up front (in code or a TOML/JSON file) and checked by
//! the [`WorkflowValidator`] before the runner starts. The runner itself never
//! walks the graph; it routes by event metadata.

pub mod edge;
pub mod node;
pub mod validator;

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use weave_core::error::{Result, WeaveError};

pub use edge::{EdgeKind, GraphEdge};
pub use node::{AgentNode, NodeKind};
pub use validator::{
    IssueKind, ValidationError, ValidationResult, ValidationWarning, ValidatorLimits,
    WorkflowValidator,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: BTreeMap<String, AgentNode>,
    #[serde(default)]
    pub edges: Vec<GraphEdge>,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node keyed by its name.
    pub fn with_node(mut self, node: AgentNode) -> Self {
        self.add_node(node);
        self
    }

    pub fn with_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(GraphEdge::flow(from, to));
        self
    }

    pub fn with_typed_edge(mut self, edge: GraphEdge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn add_node(&mut self, node: AgentNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub fn add_edge(&mut self, edge: GraphEdge) {
        self.edges.push(edge);
    }

    pub fn entry_points(&self) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.is_entry_point)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Explicit edges plus the ones implied by node dependencies and routes,
    /// without duplicate `(from, to)` pairs. Explicit edges win.
    pub fn effective_edges(&self) -> Vec<GraphEdge> {
        let implied = self.nodes.iter().flat_map(|(key, node)| {
            let deps = node
                .dependencies
                .iter()
                .map(move |dep| GraphEdge::new(dep.clone(), key.clone(), EdgeKind::Dependency));
            let routes = node
                .routes
                .iter()
                .map(move |to| GraphEdge::route(key.clone(), to.clone()));
            deps.chain(routes)
        });

        let mut seen = HashSet::new();
        self.edges
            .iter()
            .cloned()
            .chain(implied)
            .filter(|e| seen.insert((e.from.clone(), e.to.clone())))
            .collect()
    }

    /// Load a graph from a `.json` file, or TOML for any other extension.
    ///
    /// Nodes without a name take their map key.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json(&content)
        } else {
            Self::from_toml(&content)
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let graph: Self = toml::from_str(content)
            .map_err(|e| WeaveError::InvalidWorkflow(format!("graph TOML: {}", e)))?;
        Ok(graph.with_names_filled())
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let graph: Self = serde_json::from_str(content)?;
        Ok(graph.with_names_filled())
    }

    fn with_names_filled(mut self) -> Self {
        for (key, node) in self.nodes.iter_mut() {
            if node.name.is_empty() {
                node.name = key.clone();
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_edges_include_implied() {
        let graph = WorkflowGraph::new()
            .with_node(AgentNode::new("a").entry().routes_to("b"))
            .with_node(AgentNode::new("b"))
            .with_node(AgentNode::new("c").depends_on("b"))
            .with_edge("a", "b");

        let edges = graph.effective_edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0], GraphEdge::flow("a", "b"));
        assert_eq!(edges[1], GraphEdge::new("b", "c", EdgeKind::Dependency));
    }

    #[test]
    fn test_from_toml_fills_names() {
        let graph = WorkflowGraph::from_toml(
            r#"
[nodes.planner]
is_entry_point = true
routes = ["writer"]

[nodes.writer]
is_endpoint = true

[[edges]]
from = "writer"
to = "error-handler"
type = "error"

[nodes.error-handler]
kind = "error_handler"
"#,
        )
        .unwrap();

        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.nodes["planner"].name, "planner");
        assert_eq!(graph.nodes["error-handler"].kind, NodeKind::ErrorHandler);
        assert_eq!(graph.entry_points(), vec!["planner"]);
        assert_eq!(graph.edges[0].kind, EdgeKind::Error);
    }

    #[test]
    fn test_load_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.json");
        std::fs::write(
            &path,
            r#"{"nodes":{"a":{"is_entry_point":true},"b":{}},"edges":[{"from":"a","to":"b"}]}"#,
        )
        .unwrap();

        let graph = WorkflowGraph::load(&path).unwrap();
        assert_eq!(graph.nodes["b"].name, "b");
        assert_eq!(graph.edges, vec![GraphEdge::flow("a", "b")]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = WorkflowGraph::load(Path::new("/nonexistent/flow.toml")).unwrap_err();
        assert!(matches!(err, WeaveError::Io(_)));
    }
}
