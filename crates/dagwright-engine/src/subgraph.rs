use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use dagwright_core::{
    DagError, EventSink, ExecutionResult, Node, Payload, Result, STDOUT_KEY,
};

use crate::graph::{Executor, Graph};

/// Derives a node's `stdout` from the inner execution result.
pub type StdoutAdapter = Box<dyn Fn(&ExecutionResult) -> Result<Value> + Send + Sync>;

/// A node that runs a nested graph.
///
/// Input keys naming inner nodes with object values become those nodes'
/// initial inputs. Every other key (a routed `stdin`, for example) is
/// merged into each inner source node's input without overriding values
/// addressed to that node explicitly.
pub struct SubgraphNode {
    id: String,
    graph: Graph,
    adapter: Option<StdoutAdapter>,
    sink: Option<Arc<dyn EventSink>>,
    primary_output_key: String,
}

impl SubgraphNode {
    pub fn new(id: impl Into<String>, graph: Graph) -> Self {
        Self {
            id: id.into(),
            graph,
            adapter: None,
            sink: None,
            primary_output_key: STDOUT_KEY.to_string(),
        }
    }

    pub fn with_adapter(mut self, adapter: StdoutAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Expose the primary output of inner node `node_id` as this node's `stdout`.
    pub fn with_stdout_from(self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        let key = self.primary_output_key.clone();
        self.with_adapter(Box::new(move |result: &ExecutionResult| {
            result
                .output(&node_id)
                .and_then(|out| out.get(&key))
                .cloned()
                .ok_or_else(|| {
                    DagError::Adapter(format!("inner node '{}' produced no {}", node_id, key))
                })
        }))
    }

    /// Share an event sink with the inner executor.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_optional_sink(mut self, sink: Option<Arc<dyn EventSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_primary_output_key(mut self, key: impl Into<String>) -> Self {
        self.primary_output_key = key.into();
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn inner_inputs(&self, input: Payload) -> HashMap<String, Payload> {
        let mut inputs: HashMap<String, Payload> = HashMap::new();
        let mut shared = Payload::new();

        for (key, value) in input {
            match value {
                Value::Object(map) if self.graph.contains(&key) => {
                    inputs.insert(key, map);
                }
                other => {
                    shared.insert(key, other);
                }
            }
        }

        if !shared.is_empty() {
            for source in self.graph.source_nodes() {
                let entry = inputs.entry(source.to_string()).or_default();
                for (key, value) in &shared {
                    entry.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        inputs
    }
}

impl Node for SubgraphNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "subgraph"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let executor = Executor::new()
                .with_optional_sink(self.sink.clone())
                .with_primary_output_key(self.primary_output_key.clone());

            debug!(node_id = %self.id, inner_nodes = self.graph.len(), "Running subgraph");
            let result = executor.execute(&self.graph, self.inner_inputs(input)).await;

            let node_results: Payload = result
                .node_results
                .iter()
                .map(|(id, r)| (id.clone(), Value::Object(r.output.clone())))
                .collect();

            let mut summary = json!({
                "execution_order": result.execution_order,
                "node_results": node_results,
                "skipped": result.skipped,
                "error_message": result.error_message,
            });
            let mut success = result.success;
            let mut output = Payload::new();

            if let Some(adapter) = &self.adapter {
                match adapter(&result) {
                    Ok(value) => {
                        output.insert(self.primary_output_key.clone(), value);
                    }
                    Err(e) => {
                        warn!(node_id = %self.id, error = %e, "Subgraph adapter failed");
                        success = false;
                        summary["adapter_error"] = json!(e.to_string());
                    }
                }
            }

            output.insert("success".into(), json!(success));
            output.insert("subgraph".into(), summary);
            Ok(output)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagwright_test_utils::{payload, EchoNode, FailingNode, RecordingSink, StaticNode};

    fn echo_chain() -> Graph {
        let mut g = Graph::new();
        g.add_node(EchoNode::new("first")).unwrap();
        g.add_node(EchoNode::new("second")).unwrap();
        g.add_edge("first", "second").unwrap();
        g
    }

    #[tokio::test]
    async fn test_stdin_reaches_inner_sources() {
        let node = SubgraphNode::new("sub", echo_chain()).with_stdout_from("second");
        let out = node.execute(payload(json!({"stdin": "piped"}))).await.unwrap();

        assert_eq!(out["success"], json!(true));
        assert_eq!(out["stdout"], json!("piped"));
        assert_eq!(
            out["subgraph"]["execution_order"],
            json!([["first"], ["second"]])
        );
        assert_eq!(
            out["subgraph"]["node_results"]["first"]["stdout"],
            json!("piped")
        );
    }

    #[tokio::test]
    async fn test_per_node_inputs_win_over_shared() {
        let node = SubgraphNode::new("sub", echo_chain());
        let out = node
            .execute(payload(json!({
                "stdin": "shared",
                "first": {"stdin": "direct"},
            })))
            .await
            .unwrap();
        assert_eq!(
            out["subgraph"]["node_results"]["first"]["stdout"],
            json!("direct")
        );
    }

    #[tokio::test]
    async fn test_inner_failure_reported() {
        let mut g = Graph::new();
        g.add_node(FailingNode::new("boom", "inner broke")).unwrap();
        let out = SubgraphNode::new("sub", g)
            .execute(Payload::new())
            .await
            .unwrap();

        assert_eq!(out["success"], json!(false));
        assert!(out["subgraph"]["error_message"]
            .as_str()
            .unwrap()
            .contains("inner broke"));
        assert!(out.get("stdout").is_none());
    }

    #[tokio::test]
    async fn test_adapter_failure_marks_node_failed() {
        let mut g = Graph::new();
        g.add_node(StaticNode::new("a", json!({"stdout": "x"}))).unwrap();
        let node = SubgraphNode::new("sub", g).with_adapter(Box::new(|_: &ExecutionResult| {
            Err(DagError::Adapter("cannot summarize".into()))
        }));

        let out = node.execute(Payload::new()).await.unwrap();
        assert_eq!(out["success"], json!(false));
        assert!(out["subgraph"]["adapter_error"]
            .as_str()
            .unwrap()
            .contains("cannot summarize"));
    }

    #[tokio::test]
    async fn test_stdout_from_missing_node() {
        let mut g = Graph::new();
        g.add_node(StaticNode::empty("a")).unwrap();
        let out = SubgraphNode::new("sub", g)
            .with_stdout_from("nope")
            .execute(Payload::new())
            .await
            .unwrap();
        assert_eq!(out["success"], json!(false));
        assert!(out["subgraph"].get("adapter_error").is_some());
    }

    #[tokio::test]
    async fn test_nested_in_outer_graph_pipes_stdout() {
        let sink = RecordingSink::new();
        let inner = SubgraphNode::new("sub", echo_chain())
            .with_stdout_from("second")
            .with_sink(sink.clone());

        let mut outer = Graph::new();
        outer
            .add_node(StaticNode::new("src", json!({"stdout": "hello"})))
            .unwrap();
        outer.add_node(inner).unwrap();
        outer.add_node(EchoNode::new("after")).unwrap();
        outer.add_edge("src", "sub").unwrap();
        outer.add_edge("sub", "after").unwrap();

        let result = Executor::new()
            .with_sink(sink.clone())
            .execute(&outer, HashMap::new())
            .await;

        assert!(result.success);
        assert_eq!(result.output("after").unwrap()["stdout"], json!("hello"));
        // Outer and inner runs both report to the shared sink.
        assert_eq!(sink.count("exec.start"), 2);
    }
}
