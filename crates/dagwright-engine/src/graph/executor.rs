use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use dagwright_core::config::ExecutionConfig;
use dagwright_core::{
    DagError, EventSink, ExecutionId, ExecutionResult, GraphEvent, NodeExecutionResult, Payload, Result,
    STDIN_KEY, STDOUT_KEY,
};

use super::dag::Graph;

/// Executes a graph layer by layer.
///
/// Nodes within a layer run concurrently and the layer is a barrier: no
/// node of layer `k + 1` starts before every node of layer `k` has finished.
/// Each completed node's output becomes visible to edge conditions under
/// its id, and its primary output is routed into the `stdin` of every
/// target reached by a taken edge.
pub struct Executor {
    sink: Option<Arc<dyn EventSink>>,
    primary_output_key: String,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    pub fn new() -> Self {
        Self {
            sink: None,
            primary_output_key: STDOUT_KEY.to_string(),
        }
    }

    /// Build an executor from the `[engine]` config section.
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self::new().with_primary_output_key(config.primary_output_key.clone())
    }

    /// Attach an event sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_optional_sink(mut self, sink: Option<Arc<dyn EventSink>>) -> Self {
        self.sink = sink;
        self
    }

    /// Override the output key routed downstream (default `stdout`).
    pub fn with_primary_output_key(mut self, key: impl Into<String>) -> Self {
        self.primary_output_key = key.into();
        self
    }

    pub fn primary_output_key(&self) -> &str {
        &self.primary_output_key
    }

    fn emit(&self, event: GraphEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// Run every eligible node of `graph`.
    ///
    /// `initial_inputs` maps node ids to their starting input. Node failures
    /// never abort the run; a malformed graph (a cycle) aborts before any
    /// node executes. Either way the outcome is reported in the returned
    /// result rather than as an error.
    pub async fn execute(
        &self,
        graph: &Graph,
        initial_inputs: HashMap<String, Payload>,
    ) -> ExecutionResult {
        let execution_id = ExecutionId::new();
        let start = Instant::now();

        let layers = match graph.topological_layers() {
            Ok(layers) => layers,
            Err(e) => {
                warn!(execution_id = %execution_id, error = %e, "Graph rejected before execution");
                let result = ExecutionResult::aborted(execution_id, &e);
                self.emit(GraphEvent::ExecutionFinished {
                    execution_id: result.execution_id.clone(),
                    success: false,
                    error: result.error_message.clone(),
                });
                return result;
            }
        };

        info!(
            execution_id = %execution_id,
            nodes = graph.len(),
            layers = layers.len(),
            "Executing graph"
        );
        self.emit(GraphEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
            layers: layers.clone(),
        });

        let mut inputs = initial_inputs;
        // Completed node id -> output, the namespace conditions resolve against.
        let mut namespace = Payload::new();
        let mut node_results: HashMap<String, NodeExecutionResult> = HashMap::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut error_message: Option<String> = None;

        for layer in &layers {
            let mut dispatched: Vec<&str> = Vec::with_capacity(layer.len());
            let mut pending: Vec<BoxFuture<'_, Result<Payload>>> = Vec::with_capacity(layer.len());

            for node_id in layer {
                let Some(node) = graph.node(node_id) else {
                    continue;
                };

                if let Some(reason) = self.blocked_reason(graph, node_id, &namespace) {
                    debug!(node_id = %node_id, reason = %reason, "Skipping node");
                    self.emit(GraphEvent::NodeSkipped {
                        node_id: node_id.clone(),
                        reason,
                    });
                    skipped.push(node_id.clone());
                    continue;
                }

                let input = inputs.remove(node_id.as_str()).unwrap_or_default();
                debug!(node_id = %node_id, kind = node.kind(), "Dispatching node");
                self.emit(GraphEvent::NodeStart {
                    node_id: node_id.clone(),
                    node_type: node.kind().to_string(),
                    input: input.clone(),
                });
                dispatched.push(node_id);
                let id = node_id.clone();
                pending.push(
                    AssertUnwindSafe(node.execute(input))
                        .catch_unwind()
                        .map(move |caught| caught.unwrap_or_else(|panic| Err(panicked(&id, panic))))
                        .boxed(),
                );
            }

            let outcomes = join_all(pending).await;

            for (node_id, outcome) in dispatched.iter().zip(outcomes) {
                let result = NodeExecutionResult::from_outcome(*node_id, outcome);
                self.emit(GraphEvent::NodeOutput {
                    node_id: node_id.to_string(),
                    output: result.output.clone(),
                });

                if result.success {
                    debug!(node_id = %node_id, "Node succeeded");
                    self.emit(GraphEvent::NodeSuccess {
                        node_id: node_id.to_string(),
                        output: result.output.clone(),
                    });
                } else {
                    let error = result
                        .error
                        .clone()
                        .unwrap_or_else(|| "Node execution failed".to_string());
                    warn!(node_id = %node_id, error = %error, "Node failed");
                    self.emit(GraphEvent::NodeFailed {
                        node_id: node_id.to_string(),
                        error: error.clone(),
                    });
                    if error_message.is_none() {
                        error_message = Some(error);
                    }
                }

                namespace.insert(node_id.to_string(), Value::Object(result.output.clone()));
                node_results.insert(node_id.to_string(), result);
            }

            // Route only once the whole layer is visible to conditions.
            for node_id in &dispatched {
                self.route(graph, node_id, &node_results, &namespace, &mut inputs);
            }
        }

        let success = error_message.is_none();
        info!(
            execution_id = %execution_id,
            success,
            ran = node_results.len(),
            skipped = skipped.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Graph execution complete"
        );
        self.emit(GraphEvent::ExecutionFinished {
            execution_id: execution_id.clone(),
            success,
            error: error_message.clone(),
        });

        ExecutionResult {
            execution_id,
            success,
            node_results,
            execution_order: layers,
            skipped,
            error_message,
        }
    }

    /// Why a node must be skipped, or `None` if it may run.
    ///
    /// A node runs when it has no incoming edges, when any incoming edge is
    /// unconditional, or when every conditional incoming edge holds.
    fn blocked_reason(&self, graph: &Graph, node_id: &str, namespace: &Payload) -> Option<String> {
        let mut failed: Vec<&str> = Vec::new();

        for edge in graph.incoming(node_id) {
            match &edge.condition {
                None => return None,
                Some(condition) => {
                    if !condition.check(namespace) {
                        failed.push(condition.source());
                    }
                }
            }
        }

        if failed.is_empty() {
            None
        } else {
            Some(format!("conditions not satisfied: {}", failed.join(", ")))
        }
    }

    fn route(
        &self,
        graph: &Graph,
        node_id: &str,
        results: &HashMap<String, NodeExecutionResult>,
        namespace: &Payload,
        inputs: &mut HashMap<String, Payload>,
    ) {
        let primary = results
            .get(node_id)
            .and_then(|r| r.output.get(&self.primary_output_key))
            .filter(|v| !v.is_null());

        for edge in graph.outgoing(node_id) {
            let taken = edge.is_taken(namespace);
            self.emit(GraphEvent::EdgeEval {
                source: edge.from.clone(),
                target: edge.to.clone(),
                condition: edge.condition_text().map(String::from),
                result: taken,
            });

            if !taken {
                self.emit(GraphEvent::EdgeBlocked {
                    source: edge.from.clone(),
                    target: edge.to.clone(),
                    condition: edge.condition_text().unwrap_or_default().to_string(),
                });
                continue;
            }

            self.emit(GraphEvent::EdgeTaken {
                source: edge.from.clone(),
                target: edge.to.clone(),
            });
            if let Some(value) = primary {
                // An explicit stdin (initial input or an earlier edge) wins.
                inputs
                    .entry(edge.to.clone())
                    .or_default()
                    .entry(STDIN_KEY)
                    .or_insert_with(|| value.clone());
            }
        }
    }
}

/// A panic inside a node becomes that node's failure.
fn panicked(node_id: &str, panic: Box<dyn Any + Send>) -> DagError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    warn!(node_id = %node_id, panic = %message, "Node panicked");
    DagError::NodeExecution {
        node: node_id.to_string(),
        message: format!("node panicked: {}", message),
    }
}
