//! JSON graph definitions.
//!
//! ```json
//! {
//!   "name": "build",
//!   "description": "compile then test",
//!   "nodes": [
//!     {"id": "compile", "type": "unix", "command": "make"},
//!     {"id": "ask", "type": "user_input", "config": {"prompt": "Ship?", "options": ["yes", "no"]}}
//!   ],
//!   "edges": [
//!     {"from": "compile", "to": "ask", "condition": "compile.success"}
//!   ]
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use dagwright_core::config::ExecutionConfig;
use dagwright_core::{DagError, EngineConfig, EventSink, Payload, Result};
use dagwright_engine::Graph;

use crate::registry::NodeRegistry;

/// A declarative graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

impl GraphDefinition {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| DagError::Load(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DagError::Load(format!("invalid JSON: {}", e)))
    }
}

/// One node declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Shell command for `unix` nodes; may also be given as `config.command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub config: Payload,
}

/// One edge declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// A built graph together with its metadata.
#[derive(Debug)]
pub struct LoadedGraph {
    pub name: String,
    pub description: String,
    pub graph: Graph,
}

/// Turns graph definitions into executable graphs.
///
/// Command timeouts and while-loop ceilings not set in a definition come
/// from the engine config. Subgraph and loop nodes share the loader's sink.
#[derive(Clone)]
pub struct GraphLoader {
    registry: NodeRegistry,
    config: ExecutionConfig,
    sink: Option<Arc<dyn EventSink>>,
}

impl GraphLoader {
    /// A loader with every built-in node type registered.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            registry: NodeRegistry::with_builtins(),
            config: config.engine.clone(),
            sink: None,
        }
    }

    pub fn with_registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Register custom node types.
    pub fn registry_mut(&mut self) -> &mut NodeRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.sink.clone()
    }

    /// Load a graph definition file.
    pub fn load_file(&self, path: &Path) -> Result<LoadedGraph> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DagError::Load(format!("cannot read graph file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loading graph definition");
        self.load_str(&text)
    }

    /// Load a graph definition from JSON text.
    pub fn load_str(&self, text: &str) -> Result<LoadedGraph> {
        self.load_definition(GraphDefinition::from_json(text)?)
    }

    /// Load a graph definition from a parsed JSON value.
    pub fn from_value(&self, value: Value) -> Result<LoadedGraph> {
        self.load_definition(GraphDefinition::from_value(value)?)
    }

    pub fn load_definition(&self, definition: GraphDefinition) -> Result<LoadedGraph> {
        let graph = self.build(&definition)?;
        info!(
            name = %definition.name,
            nodes = graph.len(),
            edges = graph.edges().len(),
            "Loaded graph"
        );
        Ok(LoadedGraph {
            name: definition.name,
            description: definition.description,
            graph,
        })
    }

    /// Build the graph a definition describes, including nested bodies.
    pub fn build(&self, definition: &GraphDefinition) -> Result<Graph> {
        let mut graph = Graph::new();

        for spec in &definition.nodes {
            if spec.id.is_empty() {
                return Err(DagError::Load(format!("node missing 'id': {:?}", spec)));
            }
            if spec.kind.is_empty() {
                return Err(DagError::Load(format!("node '{}' missing 'type'", spec.id)));
            }
            let node = self.registry.build(spec, self).map_err(into_load)?;
            graph.add_boxed_node(node).map_err(into_load)?;
        }

        for edge in &definition.edges {
            if edge.from.is_empty() || edge.to.is_empty() {
                return Err(DagError::Load(format!(
                    "edge missing 'from' or 'to': {:?}",
                    edge
                )));
            }
            let added = match &edge.condition {
                Some(expr) => graph.add_conditional_edge(&edge.from, &edge.to, expr),
                None => graph.add_edge(&edge.from, &edge.to),
            };
            added.map_err(|e| {
                DagError::Load(format!("edge {} -> {}: {}", edge.from, edge.to, e))
            })?;
        }

        Ok(graph)
    }
}

fn into_load(e: DagError) -> DagError {
    match e {
        DagError::Load(_) => e,
        other => DagError::Load(other.to_string()),
    }
}

/// Load a graph file with default config and no sink.
pub fn load_graph_from_file(path: &Path) -> Result<LoadedGraph> {
    GraphLoader::new(&EngineConfig::default()).load_file(path)
}

/// Load a graph from JSON text with default config and no sink.
pub fn load_graph_from_str(text: &str) -> Result<LoadedGraph> {
    GraphLoader::new(&EngineConfig::default()).load_str(text)
}
