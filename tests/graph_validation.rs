use std::fs;

use weave_core::failure::Severity;
use weave_runtime::{
    IssueKind, NodeKind, ValidatorLimits, WorkflowGraph, WorkflowValidator,
};

fn load(name: &str, content: &str) -> WorkflowGraph {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join(name);
    fs::write(&path, content).expect("write graph");
    WorkflowGraph::load(&path).expect("load graph")
}

#[test]
fn test_cycle_in_toml_graph() {
    let graph = load(
        "cycle.toml",
        r#"
[nodes.A]
is_entry_point = true
routes = ["B"]

[nodes.B]
is_endpoint = true

[[edges]]
from = "B"
to = "A"
"#,
    );
    assert_eq!(graph.nodes["A"].name, "A");

    let result = WorkflowValidator::default().validate_graph(&graph);
    assert!(!result.is_valid);
    let cycle = result
        .errors
        .iter()
        .find(|e| e.kind == IssueKind::CircularDependency)
        .expect("cycle reported");
    assert_eq!(cycle.severity, Severity::Critical);
    assert_eq!(cycle.details.get("path").map(String::as_str), Some("A -> B -> A"));
}

#[test]
fn test_linear_json_graph_is_valid() {
    let graph = load(
        "chain.json",
        r#"{
  "nodes": {
    "A": { "is_entry_point": true },
    "B": {},
    "C": { "is_endpoint": true }
  },
  "edges": [
    { "from": "A", "to": "B" },
    { "from": "B", "to": "C", "type": "route" }
  ]
}"#,
    );

    let result = WorkflowValidator::default().validate_graph(&graph);
    assert!(result.is_valid, "{}", result.render_errors());
    assert!(result.errors.is_empty());
    assert!(!result.has_warning(IssueKind::UnreachableNode));
    // No node named "error-handler" is declared.
    assert!(result.has_warning(IssueKind::MissingErrorHandler));
}

#[test]
fn test_unreachable_node_makes_graph_disconnected() {
    let graph = load(
        "split.toml",
        r#"
[nodes.A]
is_entry_point = true

[nodes.B]
is_endpoint = true
dependencies = ["A"]

[nodes.C]
"#,
    );

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
}

#[test]
fn test_error_handler_routing_depends_on_strictness() {
    let graph = load(
        "handlers.toml",
        r#"
[nodes.intake]
is_entry_point = true
routes = ["error-handler"]

[nodes.error-handler]
kind = "error_handler"
routes = ["done"]

[nodes.done]
kind = "finalizer"
is_endpoint = true
"#,
    );
    assert_eq!(graph.nodes["error-handler"].kind, NodeKind::ErrorHandler);

    let lenient = WorkflowValidator::default().validate_graph(&graph);
    assert!(lenient.is_valid, "{}", lenient.render_errors());
    assert!(!lenient.has_warning(IssueKind::MissingErrorHandler));

    let strict = WorkflowValidator::new(ValidatorLimits {
        strict: true,
        ..ValidatorLimits::default()
    })
    .validate_graph(&graph);
    assert!(!strict.is_valid);
    assert!(strict.has_error(IssueKind::InvalidRouting));
}

#[test]
fn test_result_serializes_with_wire_kinds() {
    let graph = load("lonely.toml", "[nodes.A]\n");
    let result = WorkflowValidator::default().validate_graph(&graph);

    let json = serde_json::to_value(&result).expect("serialize");
    assert_eq!(json["is_valid"], serde_json::json!(false));
    let kinds: Vec<&str> = json["errors"]
        .as_array()
        .expect("errors array")
        .iter()
        .filter_map(|e| e["kind"].as_str())
        .collect();
    assert!(kinds.contains(&"NO_ENTRY_POINT"));
}

#[test]
fn test_malformed_toml_is_invalid_workflow() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[nodes.A\n").expect("write graph");
    let err = WorkflowGraph::load(&path).unwrap_err();
    assert!(err.to_string().contains("graph TOML"));
}
