use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Role of a node, used for routing rules during validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Standard,
    ErrorHandler,
    ResponsibleAi,
    /// Terminal node; must not route anywhere.
    Finalizer,
}

/// A declared agent in a workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentNode {
    /// Filled from the map key when loading a graph file.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    /// Nodes that must run before this one (`dependency -> self`).
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Nodes this one may route to (`self -> route`).
    #[serde(default)]
    pub routes: Vec<String>,
    #[serde(default)]
    pub is_entry_point: bool,
    #[serde(default)]
    pub is_endpoint: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl AgentNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        self.dependencies.push(name.into());
        self
    }

    pub fn routes_to(mut self, name: impl Into<String>) -> Self {
        self.routes.push(name.into());
        self
    }

    pub fn entry(mut self) -> Self {
        self.is_entry_point = true;
        self
    }

    pub fn endpoint(mut self) -> Self {
        self.is_endpoint = true;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
