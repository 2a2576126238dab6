use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::debug;

use dagwright_core::{ExecutionResult, Node, Payload, Result, STDIN_KEY, STDOUT_KEY};

use crate::condition::Condition;

/// Loop control signal raised by a body node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Break,
    Continue,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Break => "break",
            Self::Continue => "continue",
        }
    }

    /// The triggered signal carried by a node output, if any.
    pub fn from_output(output: &Payload) -> Option<Self> {
        let triggered = output
            .get("triggered")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !triggered {
            return None;
        }
        match output.get("signal").and_then(Value::as_str) {
            Some("break") => Some(Self::Break),
            Some("continue") => Some(Self::Continue),
            _ => None,
        }
    }

    /// Strongest signal raised anywhere in a body run. Break wins.
    pub fn detect(result: &ExecutionResult) -> Option<Self> {
        let mut found = None;
        for r in result.node_results.values() {
            match Self::from_output(&r.output) {
                Some(Self::Break) => return Some(Self::Break),
                Some(Self::Continue) => found = Some(Self::Continue),
                None => {}
            }
        }
        found
    }
}

/// Node that raises a signal when its condition holds against its input.
///
/// Output is `{signal, triggered, success: true}`. While not triggered the
/// node forwards its `stdin` as `stdout` so it can sit inline in a chain.
struct SignalNode {
    id: String,
    signal: Signal,
    condition: Condition,
}

impl SignalNode {
    fn new(id: impl Into<String>, signal: Signal, condition: &str) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            signal,
            condition: Condition::parse(condition)?,
        })
    }

    fn evaluate(&self, input: &Payload) -> Payload {
        let triggered = self.condition.check(input);
        debug!(
            node_id = %self.id,
            signal = self.signal.as_str(),
            triggered,
            "Evaluated loop signal"
        );

        let mut output = Payload::new();
        output.insert("signal".into(), json!(self.signal.as_str()));
        output.insert("triggered".into(), json!(triggered));
        output.insert("success".into(), json!(true));
        if !triggered {
            if let Some(stdin) = input.get(STDIN_KEY) {
                output.insert(STDOUT_KEY.into(), stdin.clone());
            }
        }
        output
    }
}

/// Stops the enclosing loop after the current iteration.
pub struct BreakNode(SignalNode);

impl BreakNode {
    pub fn new(id: impl Into<String>, condition: &str) -> Result<Self> {
        SignalNode::new(id, Signal::Break, condition).map(Self)
    }

    pub fn condition(&self) -> &Condition {
        &self.0.condition
    }
}

impl Node for BreakNode {
    fn id(&self) -> &str {
        &self.0.id
    }

    fn kind(&self) -> &str {
        "break"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { Ok(self.0.evaluate(&input)) })
    }
}

/// Skips the rest of the current iteration's body.
///
/// The skip itself is expressed by edges leaving this node, conditioned on
/// `not <id>.triggered`.
pub struct ContinueNode(SignalNode);

impl ContinueNode {
    pub fn new(id: impl Into<String>, condition: &str) -> Result<Self> {
        SignalNode::new(id, Signal::Continue, condition).map(Self)
    }

    pub fn condition(&self) -> &Condition {
        &self.0.condition
    }
}

impl Node for ContinueNode {
    fn id(&self) -> &str {
        &self.0.id
    }

    fn kind(&self) -> &str {
        "continue"
    }

    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>> {
        Box::pin(async move { Ok(self.0.evaluate(&input)) })
    }
}
