//! Test nodes, sinks, and fixtures shared across dagwright crates.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use dagwright_core::{payload_from, DagError, EventSink, GraphEvent, Node, Payload, Result};

/// Build a payload from a `json!` object literal.
pub fn payload(value: Value) -> Payload {
    payload_from(value)
}

/// Write a graph definition to a temporary `.json` file.
pub fn graph_file(definition: &Value) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".json")
        .tempfile()
        .expect("create temp graph file");
    file.write_all(definition.to_string().as_bytes())
        .expect("write temp graph file");
    file
}

/// Event sink that keeps everything it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<GraphEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<GraphEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn type_names(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.type_name())
            .collect()
    }

    pub fn count(&self, type_name: &str) -> usize {
        self.type_names().iter().filter(|t| **t == type_name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: GraphEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Returns a fixed output regardless of input.
pub struct StaticNode {
    id: String,
    output: Payload,
}

impl StaticNode {
    pub fn new(id: impl Into<String>, output: Value) -> Self {
        Self {
            id: id.into(),
            output: payload_from(output),
        }
    }

    pub fn empty(id: impl Into<String>) -> Self {
        Self::new(id, json!({}))
    }
}

impl Node for StaticNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "static"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { Ok(self.output.clone()) })
    }
}

/// Echoes `stdin` to `stdout` and the whole input under `input`.
pub struct EchoNode {
    id: String,
}

impl EchoNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Node for EchoNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "echo"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let stdout = input.get("stdin").cloned().unwrap_or_else(|| json!(""));
            Ok(payload(json!({ "stdout": stdout, "input": input })))
        })
    }
}

/// Always returns an execution error.
pub struct FailingNode {
    id: String,
    message: String,
}

impl FailingNode {
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
        }
    }
}

impl Node for FailingNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "failing"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            Err(DagError::NodeExecution {
                node: self.id.clone(),
                message: self.message.clone(),
            })
        })
    }
}

/// Panics while executing.
pub struct PanickingNode {
    id: String,
}

impl PanickingNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Node for PanickingNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "panicking"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            let empty: Vec<u8> = Vec::new();
            let index = self.id.len() + 3;
            Ok(payload_from(json!({"stdout": empty[index]})))
        })
    }
}

/// Sleeps, then reports success.
pub struct SleepNode {
    id: String,
    delay: Duration,
}

impl SleepNode {
    pub fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }
}

impl Node for SleepNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "sleep"
    }

    fn execute(&self, _input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Ok(payload(json!({ "stdout": self.id, "success": true })))
        })
    }
}

/// Shared record of the inputs `RecordingNode`s received.
#[derive(Clone, Default)]
pub struct InputLog {
    entries: Arc<Mutex<Vec<(String, Payload)>>>,
}

impl InputLog {
    pub fn inputs_for(&self, node_id: &str) -> Vec<Payload> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == node_id)
            .map(|(_, input)| input.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Records every input it receives, then returns a fixed output.
pub struct RecordingNode {
    id: String,
    output: Payload,
    log: InputLog,
}

impl RecordingNode {
    pub fn new(id: impl Into<String>, output: Value, log: InputLog) -> Self {
        Self {
            id: id.into(),
            output: payload_from(output),
            log,
        }
    }
}

impl Node for RecordingNode {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        "recording"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move {
            self.log
                .entries
                .lock()
                .unwrap()
                .push((self.id.clone(), input));
            Ok(self.output.clone())
        })
    }
}
