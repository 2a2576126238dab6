use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::warn;

use dagwright_core::{EventSink, Node, Payload, Result, STDOUT_KEY};

use super::{LoopResult, LoopRun, Signal, TerminationReason};
use crate::condition::Condition;
use crate::graph::{Executor, Graph};

const LOOP_COUNT_KEY: &str = "loop_count";

/// Runs a body graph while a condition holds, up to `max_iterations`.
///
/// Loop state starts as the caller's input with `loop_count` defaulting to
/// 0. After each iteration every body node's output is stored in the state
/// under its node id and `loop_count` is incremented. The condition is
/// evaluated against that state before each iteration.
pub struct WhileLoopGraph {
    id: String,
    condition: Condition,
    body: Graph,
    max_iterations: usize,
    sink: Option<Arc<dyn EventSink>>,
    primary_output_key: String,
}

impl WhileLoopGraph {
    pub fn new(
        id: impl Into<String>,
        condition: &str,
        body: Graph,
        max_iterations: usize,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            condition: Condition::parse(condition)?,
            body,
            max_iterations,
            sink: None,
            primary_output_key: STDOUT_KEY.to_string(),
        })
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

    pub fn condition(&self) -> &Condition {
        &self.condition
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn body(&self) -> &Graph {
        &self.body
    }

    /// Run the loop to completion. The final state is returned in the result.
    pub async fn run(&self, input: Payload) -> LoopResult {
        let mut state = input;
        state
            .entry(LOOP_COUNT_KEY)
            .or_insert_with(|| json!(0));

        let mut run = LoopRun::start(&self.id, "while", self.sink.as_ref());

        let reason = loop {
            if !self.condition.check(&state) {
                break TerminationReason::ConditionFalse;
            }
            if run.iterations() >= self.max_iterations {
                warn!(
                    loop_id = %self.id,
                    max_iterations = self.max_iterations,
                    "While loop hit its iteration ceiling"
                );
                break TerminationReason::MaxIterations;
            }

            let index = run.iterations();
            run.begin(index);
            let executor = Executor::new()
                .with_optional_sink(self.sink.clone())
                .with_primary_output_key(self.primary_output_key.clone());
            let result = executor
                .execute(&self.body, self.iteration_inputs(&state, index))
                .await;

            for (node_id, r) in &result.node_results {
                state.insert(node_id.clone(), Value::Object(r.output.clone()));
            }
            increment_loop_count(&mut state);

            if run.record(index, &self.body, &result) == Some(Signal::Break) {
                break TerminationReason::Break;
            }
        };

        run.finish(reason, Some(state))
    }

    /// Non-node state entries plus `index`, copied to every body node.
    fn iteration_inputs(&self, state: &Payload, index: usize) -> HashMap<String, Payload> {
        let mut shared: Payload = state
            .iter()
            .filter(|(key, _)| !self.body.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        shared.insert("index".into(), json!(index));

        self.body
            .node_ids()
            .map(|node_id| (node_id.to_string(), shared.clone()))
            .collect()
    }
}

fn increment_loop_count(state: &mut Payload) {
    let next = match state.get(LOOP_COUNT_KEY) {
        Some(Value::Number(n)) if n.is_i64() || n.is_u64() => json!(n.as_i64().unwrap_or(0) + 1),
        Some(Value::Number(n)) => json!(n.as_f64().unwrap_or(0.0) + 1.0),
        _ => json!(1),
    };
    state.insert(LOOP_COUNT_KEY.into(), next);
}

impl Node for WhileLoopGraph {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "while_loop"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { self.run(input).await.into_payload() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_flow::BreakNode;
    use dagwright_core::DagError;
    use dagwright_test_utils::{payload, InputLog, RecordingNode, RecordingSink, StaticNode};

    fn noop_body() -> Graph {
        let mut g = Graph::new();
        g.add_node(StaticNode::new("noop", json!({"stdout": "incremented"})))
            .unwrap();
        g
    }

    #[tokio::test]
    async fn test_runs_until_condition_false() {
        let result = WhileLoopGraph::new("w", "loop_count < 3", noop_body(), 10)
            .unwrap()
            .run(payload(json!({"loop_count": 0})))
            .await;

        assert!(result.success);
        assert_eq!(result.iterations, 3);
        assert_eq!(result.termination_reason, TerminationReason::ConditionFalse);
        let state = result.state.unwrap();
        assert_eq!(state["loop_count"], json!(3));
        assert_eq!(state["noop"]["stdout"], json!("incremented"));
    }

    #[tokio::test]
    async fn test_max_iterations_ceiling() {
        let sink = RecordingSink::new();
        let result = WhileLoopGraph::new("w", "True", noop_body(), 5)
            .unwrap()
            .with_sink(sink.clone())
            .run(Payload::new())
            .await;

        assert_eq!(result.iterations, 5);
        assert_eq!(result.termination_reason, TerminationReason::MaxIterations);
        assert_eq!(sink.count("loop.iteration.end"), 5);
    }

    #[tokio::test]
    async fn test_false_condition_runs_nothing() {
        let result = WhileLoopGraph::new("w", "loop_count > 0", noop_body(), 5)
            .unwrap()
            .run(Payload::new())
            .await;
        assert!(result.success);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.termination_reason, TerminationReason::ConditionFalse);
    }

    #[tokio::test]
    async fn test_state_and_index_injected() {
        let log = InputLog::default();
        let mut body = Graph::new();
        body.add_node(RecordingNode::new("probe", json!({"seen": true}), log.clone()))
            .unwrap();

        WhileLoopGraph::new("w", "loop_count < 2", body, 10)
            .unwrap()
            .run(payload(json!({"target": "db"})))
            .await;

        let seen = log.inputs_for("probe");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["target"], json!("db"));
        assert_eq!(seen[0]["index"], json!(0));
        assert_eq!(seen[1]["index"], json!(1));
        assert_eq!(seen[1]["loop_count"], json!(1));
        // Node outputs stay in the state but are not fed back as inputs.
        assert!(seen[1].get("probe").is_none());
    }

    #[tokio::test]
    async fn test_condition_sees_node_outputs() {
        let mut body = Graph::new();
        body.add_node(StaticNode::new("check", json!({"done": true})))
            .unwrap();

        let result = WhileLoopGraph::new("w", "not check.done", body, 10)
            .unwrap()
            .run(Payload::new())
            .await;
        // `check` is unresolved before the first run, so the condition is false.
        assert_eq!(result.iterations, 0);

        let mut body = Graph::new();
        body.add_node(StaticNode::new("check", json!({"done": true})))
            .unwrap();
        let result = WhileLoopGraph::new("w", "loop_count == 0 or not check.done", body, 10)
            .unwrap()
            .run(Payload::new())
            .await;
        assert_eq!(result.iterations, 1);
    }

    #[tokio::test]
    async fn test_break_stops_after_iteration() {
        let mut body = Graph::new();
        body.add_node(BreakNode::new("brk", "loop_count >= 1").unwrap())
            .unwrap();

        let result = WhileLoopGraph::new("w", "True", body, 10)
            .unwrap()
            .run(Payload::new())
            .await;
        assert_eq!(result.iterations, 2);
        assert_eq!(result.termination_reason, TerminationReason::Break);
    }

    #[test]
    fn test_invalid_condition() {
        assert!(matches!(
            WhileLoopGraph::new("w", "loop_count <", noop_body(), 3),
            Err(DagError::InvalidCondition { .. })
        ));
    }

    #[tokio::test]
    async fn test_as_node_output() {
        let node = WhileLoopGraph::new("w", "loop_count < 1", noop_body(), 3).unwrap();
        let out = node.execute(Payload::new()).await.unwrap();
        assert_eq!(out["iterations"], json!(1));
        assert_eq!(out["termination_reason"], json!("condition_false"));
        assert_eq!(out["state"]["loop_count"], json!(1));
    }
}
