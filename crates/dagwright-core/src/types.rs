use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Node input and output mapping.
pub type Payload = serde_json::Map<String, Value>;

/// Input key that receives an upstream node's primary output.
pub const STDIN_KEY: &str = "stdin";

/// Default primary output key, routed downstream automatically.
pub const STDOUT_KEY: &str = "stdout";

/// Output key a node uses to report its own outcome.
pub const SUCCESS_KEY: &str = "success";

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Truthiness of a JSON value: null, false, 0, "", [] and {} are false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Convert a JSON value into a payload. Non-objects yield an empty payload.
pub fn payload_from(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Result of executing a single node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResult {
    /// Which node was executed.
    pub node_id: String,
    /// The raw output returned by the node (empty if it errored).
    pub output: Payload,
    /// Normalized success flag.
    pub success: bool,
    /// Error text when the node failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeExecutionResult {
    /// Normalize a raw node outcome.
    ///
    /// An `Err` becomes a failure carrying the error text. An `Ok` output is
    /// trusted through its `"success"` field, which defaults to true.
    pub fn from_outcome(node_id: impl Into<String>, outcome: crate::Result<Payload>) -> Self {
        let node_id = node_id.into();
        match outcome {
            Ok(output) => {
                let success = output.get(SUCCESS_KEY).map(is_truthy).unwrap_or(true);
                let error = if success {
                    None
                } else {
                    Some(failure_message(&output))
                };
                Self {
                    node_id,
                    output,
                    success,
                    error,
                }
            }
            Err(e) => Self {
                node_id,
                output: Payload::new(),
                success: false,
                error: Some(e.to_string()),
            },
        }
    }
}

fn failure_message(output: &Payload) -> String {
    ["error", "stderr"]
        .iter()
        .filter_map(|key| output.get(*key).and_then(|v| v.as_str()))
        .find(|s| !s.is_empty())
        .unwrap_or("Node execution failed")
        .to_string()
}

/// Result of executing an entire graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execution_id: ExecutionId,
    /// Whether every executed node succeeded.
    pub success: bool,
    /// Results of the nodes that actually ran.
    pub node_results: HashMap<String, NodeExecutionResult>,
    /// The computed layers, in execution order.
    pub execution_order: Vec<Vec<String>>,
    /// Nodes whose incoming edge conditions were not satisfied.
    #[serde(default)]
    pub skipped: Vec<String>,
    /// First observed failure, or the structural error that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ExecutionResult {
    /// A run that never started because the graph was malformed.
    pub fn aborted(execution_id: ExecutionId, error: &crate::DagError) -> Self {
        Self {
            execution_id,
            success: false,
            node_results: HashMap::new(),
            execution_order: vec![],
            skipped: vec![],
            error_message: Some(error.to_string()),
        }
    }

    /// Output of a node that ran.
    pub fn output(&self, node_id: &str) -> Option<&Payload> {
        self.node_results.get(node_id).map(|r| &r.output)
    }

    /// Whether a node ran (successfully or not).
    pub fn ran(&self, node_id: &str) -> bool {
        self.node_results.contains_key(node_id)
    }

    /// Ids of nodes that ran and failed, sorted.
    pub fn failed_nodes(&self) -> Vec<&str> {
        let mut failed: Vec<&str> = self
            .node_results
            .values()
            .filter(|r| !r.success)
            .map(|r| r.node_id.as_str())
            .collect();
        failed.sort_unstable();
        failed
    }

    /// Outputs of every node that ran, keyed by node id.
    pub fn outputs(&self) -> Payload {
        self.node_results
            .iter()
            .map(|(id, r)| (id.clone(), Value::Object(r.output.clone())))
            .collect()
    }
}
