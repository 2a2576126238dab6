//! Graph construction, layered execution, conditions, subgraphs, and loops.

pub mod condition;
pub mod control_flow;
pub mod graph;
pub mod subgraph;

pub use condition::{Condition, EvalError};
pub use control_flow::{
    BreakNode, ContinueNode, ForLoopGraph, LoopResult, Signal, TerminationReason, WhileLoopGraph,
};
pub use graph::{Edge, Executor, Graph};
pub use subgraph::{StdoutAdapter, SubgraphNode};
