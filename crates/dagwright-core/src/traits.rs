use futures::future::BoxFuture;

use crate::error::Result;
use crate::event::GraphEvent;
use crate::types::Payload;

/// A single executable unit in a graph.
pub trait Node: Send + Sync + 'static {
    /// Unique id within the owning graph.
    fn id(&self) -> &str;

    /// Node kind (e.g. "unix", "subgraph"), reported in lifecycle events.
    fn kind(&self) -> &str;

    /// Execute the node's work.
    ///
    /// The input is an owned copy; implementations return a fresh output
    /// mapping. Returning `Err` marks the node failed without aborting the
    /// surrounding graph.
    fn execute(&self, input: Payload) -> BoxFuture<'_, Result<Payload>>;
}

/// Receives structured lifecycle notifications.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: GraphEvent);
}
