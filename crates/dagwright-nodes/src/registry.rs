use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use dagwright_core::{DagError, Node, Result};
use dagwright_engine::{BreakNode, ContinueNode, ForLoopGraph, SubgraphNode, WhileLoopGraph};

use crate::command::CommandNode;
use crate::loader::{GraphDefinition, GraphLoader, NodeSpec};
use crate::user_input::UserInputNode;

/// Builds a node from its declaration. The loader is passed in so factories
/// can read engine defaults and build nested bodies.
pub type NodeFactory =
    Arc<dyn Fn(&NodeSpec, &GraphLoader) -> Result<Box<dyn Node>> + Send + Sync>;

/// Registry of node factories, keyed by declared node type.
#[derive(Clone)]
pub struct NodeRegistry {
    factories: HashMap<String, NodeFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory. Replaces any factory already registered for `kind`.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&NodeSpec, &GraphLoader) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Arc::new(factory));
    }

    /// Unregister a factory by type.
    pub fn unregister(&mut self, kind: &str) -> bool {
        self.factories.remove(kind).is_some()
    }

    pub fn get(&self, kind: &str) -> Option<NodeFactory> {
        self.factories.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Build a node from its declaration.
    pub fn build(&self, spec: &NodeSpec, loader: &GraphLoader) -> Result<Box<dyn Node>> {
        let factory = self.get(&spec.kind).ok_or_else(|| {
            DagError::Load(format!(
                "unknown node type '{}' for node '{}'",
                spec.kind, spec.id
            ))
        })?;
        factory(spec, loader)
    }

    /// Create a registry with every built-in node type registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register("unix", build_command);
        registry.register("command", build_command);
        registry.register("user_input", build_user_input);
        registry.register("subgraph", build_subgraph);
        registry.register("for_loop", build_for_loop);
        registry.register("while_loop", build_while_loop);
        registry.register("break", |spec: &NodeSpec, _: &GraphLoader| {
            let node = BreakNode::new(&spec.id, spec.require_str("condition")?)?;
            Ok(Box::new(node) as Box<dyn Node>)
        });
        registry.register("continue", |spec: &NodeSpec, _: &GraphLoader| {
            let node = ContinueNode::new(&spec.id, spec.require_str("condition")?)?;
            Ok(Box::new(node) as Box<dyn Node>)
        });

        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn build_command(spec: &NodeSpec, loader: &GraphLoader) -> Result<Box<dyn Node>> {
    let command = match &spec.command {
        Some(command) => command.as_str(),
        None => spec.require_str("command")?,
    };

    let timeout = match spec.config.get("timeout") {
        None => loader.config().command_timeout(),
        Some(value) => value
            .as_f64()
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| spec.invalid("timeout", "a non-negative number of seconds"))?,
    };

    let mut node = CommandNode::new(&spec.id, command).with_timeout(timeout);
    if let Some(dir) = spec.optional_str("working_dir")? {
        node = node.with_working_dir(dir);
    }
    if let Some(env) = spec.config.get("env") {
        let env = env
            .as_object()
            .ok_or_else(|| spec.invalid("env", "an object of strings"))?;
        for (key, value) in env {
            let value = value
                .as_str()
                .ok_or_else(|| spec.invalid("env", "an object of strings"))?;
            node = node.with_env(key, value);
        }
    }
    Ok(Box::new(node))
}

fn build_user_input(spec: &NodeSpec, _loader: &GraphLoader) -> Result<Box<dyn Node>> {
    let prompt = spec.optional_str("prompt")?.unwrap_or(spec.id.as_str());
    let mut node = UserInputNode::new(&spec.id, prompt);

    if let Some(options) = spec.config.get("options") {
        let options = options
            .as_array()
            .and_then(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map(String::from))
                    .collect::<Option<Vec<_>>>()
            })
            .ok_or_else(|| spec.invalid("options", "an array of strings"))?;
        node = node.with_options(options);
    }
    if let Some(default) = spec.optional_str("default")? {
        node = node.with_default(default);
    }
    if let Some(interactive) = spec.config.get("interactive") {
        let interactive = interactive
            .as_bool()
            .ok_or_else(|| spec.invalid("interactive", "a boolean"))?;
        node = node.interactive(interactive);
    }
    Ok(Box::new(node))
}

fn build_subgraph(spec: &NodeSpec, loader: &GraphLoader) -> Result<Box<dyn Node>> {
    let inner = loader.build(&spec.require_definition("graph")?)?;
    let mut node = SubgraphNode::new(&spec.id, inner)
        .with_optional_sink(loader.sink())
        .with_primary_output_key(loader.config().primary_output_key.clone());
    if let Some(from) = spec.optional_str("stdout_from")? {
        node = node.with_stdout_from(from);
    }
    Ok(Box::new(node))
}

fn build_for_loop(spec: &NodeSpec, loader: &GraphLoader) -> Result<Box<dyn Node>> {
    let body = loader.build(&spec.require_definition("body")?)?;

    let mut node = match spec.config.get("items") {
        None => ForLoopGraph::from_input(&spec.id, body),
        Some(Value::Array(items)) => ForLoopGraph::new(&spec.id, items.clone(), body),
        Some(_) => return Err(spec.invalid("items", "an array")),
    };
    node = node
        .with_optional_sink(loader.sink())
        .with_primary_output_key(loader.config().primary_output_key.clone());

    if let Some(target) = spec.optional_str("item_input_node")? {
        node = node
            .with_item_input_node(target)
            .map_err(|e| DagError::Load(format!("node '{}': {}", spec.id, e)))?;
    }
    if let Some(fail_fast) = spec.config.get("fail_fast") {
        let fail_fast = fail_fast
            .as_bool()
            .ok_or_else(|| spec.invalid("fail_fast", "a boolean"))?;
        node = node.with_fail_fast(fail_fast);
    }
    Ok(Box::new(node))
}

fn build_while_loop(spec: &NodeSpec, loader: &GraphLoader) -> Result<Box<dyn Node>> {
    let body = loader.build(&spec.require_definition("body")?)?;
    let max_iterations = match spec.config.get("max_iterations") {
        None => loader.config().max_iterations,
        Some(value) => value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| spec.invalid("max_iterations", "a non-negative integer"))?,
    };

    let node = WhileLoopGraph::new(
        &spec.id,
        spec.require_str("condition")?,
        body,
        max_iterations,
    )?
    .with_optional_sink(loader.sink())
    .with_primary_output_key(loader.config().primary_output_key.clone());
    Ok(Box::new(node))
}

impl NodeSpec {
    /// A required string entry of `config`.
    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.optional_str(key)?
            .ok_or_else(|| DagError::Load(format!("node '{}': missing config.{}", self.id, key)))
    }

    /// An optional string entry of `config`; present but not a string is an error.
    pub fn optional_str(&self, key: &str) -> Result<Option<&str>> {
        match self.config.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(self.invalid(key, "a string")),
        }
    }

    /// A nested graph definition stored in `config`.
    pub fn require_definition(&self, key: &str) -> Result<GraphDefinition> {
        let value = self
            .config
            .get(key)
            .ok_or_else(|| DagError::Load(format!("node '{}': missing config.{}", self.id, key)))?;
        serde_json::from_value::<GraphDefinition>(value.clone())
            .map_err(|e| DagError::Load(format!("node '{}': config.{}: {}", self.id, key, e)))
    }

    fn invalid(&self, key: &str, expected: &str) -> DagError {
        DagError::Load(format!(
            "node '{}': config.{} must be {}",
            self.id, key, expected
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagwright_core::EngineConfig;
    use serde_json::json;

    fn spec(value: Value) -> NodeSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_builtins_registered() {
        let registry = NodeRegistry::with_builtins();
        assert_eq!(
            registry.list(),
            vec![
                "break",
                "command",
                "continue",
                "for_loop",
                "subgraph",
                "unix",
                "user_input",
                "while_loop"
            ]
        );
    }

    #[test]
    fn test_unknown_type() {
        let loader = GraphLoader::new(&EngineConfig::default());
        let err = NodeRegistry::with_builtins()
            .build(&spec(json!({"id": "x", "type": "teleport"})), &loader)
            .err()
            .unwrap();
        assert!(matches!(&err, DagError::Load(msg) if msg.contains("teleport")));
    }

    #[test]
    fn test_command_from_top_level_or_config() {
        let loader = GraphLoader::new(&EngineConfig::default());
        let registry = NodeRegistry::with_builtins();

        let node = registry
            .build(&spec(json!({"id": "a", "type": "unix", "command": "echo hi"})), &loader)
            .unwrap();
        assert_eq!(node.kind(), "unix");

        let node = registry
            .build(
                &spec(json!({"id": "b", "type": "command", "config": {"command": "true"}})),
                &loader,
            )
            .unwrap();
        assert_eq!(node.id(), "b");

        let err = registry
            .build(&spec(json!({"id": "c", "type": "unix"})), &loader)
            .err()
            .unwrap();
        assert!(err.to_string().contains("config.command"));
    }

    #[test]
    fn test_invalid_config_types() {
        let loader = GraphLoader::new(&EngineConfig::default());
        let registry = NodeRegistry::with_builtins();

        for bad in [
            json!({"id": "a", "type": "unix", "command": "true", "config": {"timeout": "soon"}}),
            json!({"id": "b", "type": "user_input", "config": {"options": [1, 2]}}),
            json!({"id": "c", "type": "while_loop", "config": {"condition": "True", "body": {}, "max_iterations": -1}}),
            json!({"id": "d", "type": "for_loop", "config": {"items": "abc", "body": {}}}),
        ] {
            let err = registry.build(&spec(bad.clone()), &loader).err().unwrap();
            assert!(matches!(err, DagError::Load(_)), "{bad}");
        }
    }

    #[test]
    fn test_custom_factory() {
        let loader = GraphLoader::new(&EngineConfig::default());
        let mut registry = NodeRegistry::new();
        registry.register("shout", |spec: &NodeSpec, _: &GraphLoader| {
            Ok(Box::new(CommandNode::new(&spec.id, "echo HEY")) as Box<dyn Node>)
        });

        assert!(registry.contains("shout"));
        let node = registry
            .build(&spec(json!({"id": "s", "type": "shout"})), &loader)
            .unwrap();
        assert_eq!(node.id(), "s");
        assert!(registry.unregister("shout"));
        assert!(!registry.contains("shout"));
    }
}
