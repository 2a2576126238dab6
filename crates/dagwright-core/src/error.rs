use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    // Graph construction errors
    #[error("Node with id '{0}' already exists")]
    DuplicateNode(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Self-loops are not allowed in DAGs: '{0}'")]
    SelfLoop(String),

    #[error("Graph contains a cycle; topological order not possible (unresolved: {})", .remaining.join(", "))]
    Cycle { remaining: Vec<String> },

    #[error("Invalid condition '{expr}': {message}")]
    InvalidCondition { expr: String, message: String },

    // Node errors
    #[error("Node execution failed: {node}: {message}")]
    NodeExecution { node: String, message: String },

    #[error("Invalid node input: {0}")]
    InvalidInput(String),

    #[error("Subgraph adapter failed: {0}")]
    Adapter(String),

    // Definition loading errors
    #[error("Graph load error: {0}")]
    Load(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DagError {
    /// Whether this error describes a malformed graph rather than a runtime failure.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateNode(_)
                | Self::UnknownNode(_)
                | Self::SelfLoop(_)
                | Self::Cycle { .. }
                | Self::InvalidCondition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_mentions_cycle_and_nodes() {
        let err = DagError::Cycle {
            remaining: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cycle"));
        assert!(msg.contains("a, b"));
        assert!(err.is_structural());
    }

    #[test]
    fn runtime_errors_are_not_structural() {
        assert!(!DagError::InvalidInput("stdin".into()).is_structural());
        assert!(!DagError::Adapter("boom".into()).is_structural());
    }
}
