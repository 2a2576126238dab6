use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::warn;

use dagwright_core::{
    DagError, EventSink, Node, Payload, Result, STDIN_KEY, STDOUT_KEY,
};

use super::{LoopResult, LoopRun, Signal, TerminationReason};
use crate::graph::{Executor, Graph};

/// Runs a body graph once per item.
///
/// Each iteration binds `item` and `index`, plus `stdin` holding the item
/// (strings verbatim, anything else as JSON text). With an item input node
/// the binding goes to that node only. Otherwise `item` and `index` go to
/// every body node and `stdin` to the body's source nodes.
pub struct ForLoopGraph {
    id: String,
    items: Option<Vec<Value>>,
    body: Graph,
    item_input_node: Option<String>,
    fail_fast: bool,
    sink: Option<Arc<dyn EventSink>>,
    primary_output_key: String,
}

impl ForLoopGraph {
    /// Loop over a fixed list of items.
    pub fn new(id: impl Into<String>, items: Vec<Value>, body: Graph) -> Self {
        Self::build(id.into(), Some(items), body)
    }

    /// Loop over items taken from the input at execute time: an `items`
    /// array, else the non-empty lines of `stdin`.
    pub fn from_input(id: impl Into<String>, body: Graph) -> Self {
        Self::build(id.into(), None, body)
    }

    fn build(id: String, items: Option<Vec<Value>>, body: Graph) -> Self {
        Self {
            id,
            items,
            body,
            item_input_node: None,
            fail_fast: false,
            sink: None,
            primary_output_key: STDOUT_KEY.to_string(),
        }
    }

    /// Send the per-iteration binding to a single body node.
    pub fn with_item_input_node(mut self, node_id: impl Into<String>) -> Result<Self> {
        let node_id = node_id.into();
        if !self.body.contains(&node_id) {
            return Err(DagError::UnknownNode(node_id));
        }
        self.item_input_node = Some(node_id);
        Ok(self)
    }

    /// Stop after the first failed iteration.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

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

    pub fn body(&self) -> &Graph {
        &self.body
    }

    /// Run the loop to completion.
    pub async fn run(&self, input: &Payload) -> Result<LoopResult> {
        let items = self.resolve_items(input)?;
        let mut run = LoopRun::start(&self.id, "for", self.sink.as_ref());
        let mut reason = TerminationReason::Exhausted;

        for (index, item) in items.iter().enumerate() {
            run.begin(index);
            let executor = Executor::new()
                .with_optional_sink(self.sink.clone())
                .with_primary_output_key(self.primary_output_key.clone());
            let result = executor
                .execute(&self.body, self.iteration_inputs(index, item))
                .await;

            if run.record(index, &self.body, &result) == Some(Signal::Break) {
                reason = TerminationReason::Break;
                break;
            }
            if self.fail_fast && !result.success {
                warn!(loop_id = %self.id, index, "Iteration failed, stopping loop");
                reason = TerminationReason::Failed;
                break;
            }
        }

        Ok(run.finish(reason, None))
    }

    fn resolve_items(&self, input: &Payload) -> Result<Vec<Value>> {
        if let Some(items) = &self.items {
            return Ok(items.clone());
        }

        match input.get("items") {
            Some(Value::Array(items)) => return Ok(items.clone()),
            Some(other) => {
                return Err(DagError::InvalidInput(format!(
                    "for loop '{}' expects an array of items, got {}",
                    self.id, other
                )))
            }
            None => {}
        }

        Ok(match input.get(STDIN_KEY) {
            Some(Value::String(text)) => text
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| json!(line))
                .collect(),
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        })
    }

    fn iteration_inputs(&self, index: usize, item: &Value) -> HashMap<String, Payload> {
        let stdin = match item {
            Value::String(s) => json!(s),
            other => json!(other.to_string()),
        };

        let mut binding = Payload::new();
        binding.insert("item".into(), item.clone());
        binding.insert("index".into(), json!(index));

        let mut inputs = HashMap::new();
        match &self.item_input_node {
            Some(node_id) => {
                binding.insert(STDIN_KEY.into(), stdin);
                inputs.insert(node_id.clone(), binding);
            }
            None => {
                let sources = self.body.source_nodes();
                for node_id in self.body.node_ids() {
                    let mut input = binding.clone();
                    if sources.contains(&node_id) {
                        input.insert(STDIN_KEY.into(), stdin.clone());
                    }
                    inputs.insert(node_id.to_string(), input);
                }
            }
        }
        inputs
    }
}

impl Node for ForLoopGraph {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "for_loop"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { self.run(&input).await?.into_payload() })
    }
}
