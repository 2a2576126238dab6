//! Bounded loops and loop control signals.
//!
//! Loop drivers own a body `Graph` and run it once per iteration with a
//! fresh set of initial inputs. They implement `Node` themselves, so a
//! loop can sit inside another loop's body or an ordinary graph.

pub mod for_loop;
pub mod signal;
pub mod while_loop;

pub use for_loop::ForLoopGraph;
pub use signal::{BreakNode, ContinueNode, Signal};
pub use while_loop::WhileLoopGraph;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use dagwright_core::{payload_from, EventSink, ExecutionResult, GraphEvent, Payload, Result};

use crate::graph::Graph;

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Every item was processed.
    Exhausted,
    /// A body node raised a break signal.
    Break,
    /// An iteration failed with fail-fast enabled.
    Failed,
    /// The while condition no longer held.
    ConditionFalse,
    /// The iteration ceiling was reached.
    MaxIterations,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::Break => "break",
            Self::Failed => "failed",
            Self::ConditionFalse => "condition_false",
            Self::MaxIterations => "max_iterations",
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a loop run. Serialized as the loop node's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopResult {
    /// Whether every iteration's body succeeded.
    pub success: bool,
    pub iterations: usize,
    /// Per iteration, node id to output for the nodes that ran.
    pub outputs: Vec<Payload>,
    pub iteration_indices: Vec<usize>,
    pub termination_reason: TerminationReason,
    /// Iterations performed by loops nested in the body, at any depth.
    pub total_inner_iterations: usize,
    /// First failure observed in any iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Final loop state (while loops only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Payload>,
}

impl LoopResult {
    pub fn into_payload(self) -> Result<Payload> {
        Ok(payload_from(serde_json::to_value(self)?))
    }
}

/// Iterations performed by the body's loop nodes in a finished run.
fn nested_iterations(body: &Graph, result: &ExecutionResult) -> usize {
    result
        .node_results
        .values()
        .filter(|r| {
            body.node(&r.node_id)
                .is_some_and(|node| matches!(node.kind(), "for_loop" | "while_loop"))
        })
        .map(|r| {
            let count = |key: &str| r.output.get(key).and_then(Value::as_u64).unwrap_or(0);
            (count("iterations") + count("total_inner_iterations")) as usize
        })
        .sum()
}

/// Bookkeeping shared by the loop drivers: accumulates iteration outcomes
/// and emits the loop lifecycle events.
pub(crate) struct LoopRun<'a> {
    loop_id: &'a str,
    sink: Option<&'a Arc<dyn EventSink>>,
    success: bool,
    outputs: Vec<Payload>,
    indices: Vec<usize>,
    inner: usize,
    error: Option<String>,
}

impl<'a> LoopRun<'a> {
    pub(crate) fn start(
        loop_id: &'a str,
        loop_type: &str,
        sink: Option<&'a Arc<dyn EventSink>>,
    ) -> Self {
        info!(loop_id, loop_type, "Loop started");
        let run = Self {
            loop_id,
            sink,
            success: true,
            outputs: Vec::new(),
            indices: Vec::new(),
            inner: 0,
            error: None,
        };
        run.emit(GraphEvent::LoopStarted {
            loop_id: loop_id.to_string(),
            loop_type: loop_type.to_string(),
        });
        run
    }

    fn emit(&self, event: GraphEvent) {
        if let Some(sink) = self.sink {
            sink.emit(event);
        }
    }

    pub(crate) fn iterations(&self) -> usize {
        self.indices.len()
    }

    pub(crate) fn begin(&self, index: usize) {
        self.emit(GraphEvent::LoopIterationStart {
            loop_id: self.loop_id.to_string(),
            index,
        });
    }

    /// Record a finished iteration and return the signal it raised.
    pub(crate) fn record(
        &mut self,
        index: usize,
        body: &Graph,
        result: &ExecutionResult,
    ) -> Option<Signal> {
        let signal = Signal::detect(result);

        if !result.success {
            self.success = false;
            if self.error.is_none() {
                self.error = result.error_message.clone();
            }
        }
        self.inner += nested_iterations(body, result);
        self.outputs.push(result.outputs());
        self.indices.push(index);

        self.emit(GraphEvent::LoopIterationEnd {
            loop_id: self.loop_id.to_string(),
            index,
            success: result.success,
            signal: signal.map(|s| s.as_str().to_string()),
        });
        signal
    }

    pub(crate) fn finish(self, reason: TerminationReason, state: Option<Payload>) -> LoopResult {
        let iterations = self.iterations();
        info!(
            loop_id = self.loop_id,
            iterations,
            reason = reason.as_str(),
            success = self.success,
            "Loop finished"
        );
        self.emit(GraphEvent::LoopFinished {
            loop_id: self.loop_id.to_string(),
            iterations,
            termination_reason: reason.as_str().to_string(),
        });
        LoopResult {
            success: self.success,
            iterations,
            outputs: self.outputs,
            iteration_indices: self.indices,
            termination_reason: reason,
            total_inner_iterations: self.inner,
            error: self.error,
            state,
        }
    }
}
