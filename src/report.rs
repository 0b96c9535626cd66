use std::path::Path;

use weave_runtime::{ValidationResult, WorkflowGraph};

struct CheckLine {
    label: String,
    ok: bool,
    detail: String,
    hints: Vec<String>,
}

pub fn print_validation(path: &Path, graph: &WorkflowGraph, result: &ValidationResult) {
    println!("Workflow {}", path.display());
    println!(
        "  {} nodes, {} edges, entry points: {}",
        graph.nodes.len(),
        graph.effective_edges().len(),
        join_or_none(&graph.entry_points())
    );
    println!();

    for line in check_lines(result) {
        let icon = if line.ok { "[--]" } else { "[!!]" };
        println!("  {} {}: {}", icon, line.label, line.detail);
        for hint in &line.hints {
            println!("       hint: {}", hint);
        }
    }

    println!();
    if result.is_valid {
        println!("  valid, {} warnings", result.warnings.len());
    } else {
        println!(
            "  invalid: {} errors, {} warnings",
            result.errors.len(),
            result.warnings.len()
        );
    }
}

fn check_lines(result: &ValidationResult) -> Vec<CheckLine> {
    let errors = result.errors.iter().map(|e| CheckLine {
        label: e.kind.to_string(),
        ok: false,
        detail: format!("{} ({})", e.message, e.severity),
        hints: e.suggestions.clone(),
    });
    let warnings = result.warnings.iter().map(|w| CheckLine {
        label: w.kind.to_string(),
        ok: true,
        detail: w.message.clone(),
        hints: Vec::new(),
    });
    errors.chain(warnings).collect()
}

fn join_or_none(names: &[&str]) -> String {
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join(", ")
    }
}
