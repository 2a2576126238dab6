use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::traits::EventSink;
use crate::types::{ExecutionId, Payload};

/// Lifecycle events emitted while a graph runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum GraphEvent {
    /// Graph execution started with the computed layers.
    #[serde(rename = "exec.start")]
    ExecutionStarted {
        execution_id: ExecutionId,
        layers: Vec<Vec<String>>,
    },
    /// Graph execution finished.
    #[serde(rename = "exec.finish")]
    ExecutionFinished {
        execution_id: ExecutionId,
        success: bool,
        error: Option<String>,
    },

    #[serde(rename = "node.start")]
    NodeStart {
        node_id: String,
        node_type: String,
        input: Payload,
    },
    #[serde(rename = "node.output")]
    NodeOutput { node_id: String, output: Payload },
    #[serde(rename = "node.success")]
    NodeSuccess { node_id: String, output: Payload },
    #[serde(rename = "node.failed")]
    NodeFailed { node_id: String, error: String },
    /// Node skipped because its incoming edge conditions were not met.
    #[serde(rename = "node.skipped")]
    NodeSkipped { node_id: String, reason: String },

    #[serde(rename = "edge.eval")]
    EdgeEval {
        source: String,
        target: String,
        condition: Option<String>,
        result: bool,
    },
    #[serde(rename = "edge.taken")]
    EdgeTaken { source: String, target: String },
    #[serde(rename = "edge.blocked")]
    EdgeBlocked {
        source: String,
        target: String,
        condition: String,
    },

    #[serde(rename = "loop.start")]
    LoopStarted { loop_id: String, loop_type: String },
    #[serde(rename = "loop.iteration.start")]
    LoopIterationStart { loop_id: String, index: usize },
    #[serde(rename = "loop.iteration.end")]
    LoopIterationEnd {
        loop_id: String,
        index: usize,
        success: bool,
        signal: Option<String>,
    },
    #[serde(rename = "loop.finish")]
    LoopFinished {
        loop_id: String,
        iterations: usize,
        termination_reason: String,
    },
}

impl GraphEvent {
    /// Dotted event type name, as used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "exec.start",
            Self::ExecutionFinished { .. } => "exec.finish",
            Self::NodeStart { .. } => "node.start",
            Self::NodeOutput { .. } => "node.output",
            Self::NodeSuccess { .. } => "node.success",
            Self::NodeFailed { .. } => "node.failed",
            Self::NodeSkipped { .. } => "node.skipped",
            Self::EdgeEval { .. } => "edge.eval",
            Self::EdgeTaken { .. } => "edge.taken",
            Self::EdgeBlocked { .. } => "edge.blocked",
            Self::LoopStarted { .. } => "loop.start",
            Self::LoopIterationStart { .. } => "loop.iteration.start",
            Self::LoopIterationEnd { .. } => "loop.iteration.end",
            Self::LoopFinished { .. } => "loop.finish",
        }
    }
}

/// A single entry in the CDC feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: GraphEvent,
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EventRecord>,
    seq: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    pub fn publish(&self, event: GraphEvent) {
        let record = EventRecord {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            event,
        };
        // Ignore error if no receivers
        let _ = self.tx.send(record);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EventRecord> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: GraphEvent) {
        self.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_sequenced_records() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(GraphEvent::EdgeTaken {
            source: "a".into(),
            target: "b".into(),
        });
        bus.emit(GraphEvent::NodeSkipped {
            node_id: "c".into(),
            reason: "condition".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        assert_eq!(first.event.type_name(), "edge.taken");
        assert!(matches!(second.event, GraphEvent::NodeSkipped { .. }));
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(GraphEvent::LoopStarted {
            loop_id: "l".into(),
            loop_type: "for_loop".into(),
        });
    }

    #[test]
    fn serializes_with_dotted_type() {
        let record = EventRecord {
            seq: 7,
            timestamp: Utc::now(),
            event: GraphEvent::EdgeBlocked {
                source: "a".into(),
                target: "b".into(),
                condition: "a.ok".into(),
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "edge.blocked");
        assert_eq!(json["seq"], 7);
        assert_eq!(json["condition"], "a.ok");
    }
}
