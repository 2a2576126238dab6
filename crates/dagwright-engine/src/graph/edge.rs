use crate::condition::Condition;
use dagwright_core::Result;

/// An edge connecting two nodes in the execution graph.
///
/// Edges carry both the scheduling dependency and the data flow: the
/// source's primary output is routed into the target's `stdin` when the
/// edge is taken.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
    /// Condition that must hold for the edge to be taken.
    /// `None` means the edge is always taken.
    pub condition: Option<Condition>,
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    /// Create a conditional edge, compiling the expression.
    pub fn conditional(
        from: impl Into<String>,
        to: impl Into<String>,
        expr: &str,
    ) -> Result<Self> {
        Ok(Self {
            from: from.into(),
            to: to.into(),
            condition: Some(Condition::parse(expr)?),
        })
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    /// The condition source text, if any.
    pub fn condition_text(&self) -> Option<&str> {
        self.condition.as_ref().map(|c| c.source())
    }

    /// Whether the edge is taken given the completed-node namespace.
    pub fn is_taken(&self, namespace: &dagwright_core::Payload) -> bool {
        self.condition.as_ref().map_or(true, |c| c.check(namespace))
    }
}
