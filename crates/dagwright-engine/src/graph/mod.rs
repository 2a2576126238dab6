//! Graph model and layered executor.
//!
//! A workflow is a directed acyclic graph of `Node`s joined by `Edge`s.
//! Edges are both scheduling dependencies and data channels; an edge may
//! carry a `Condition` that gates whether its target runs.

pub mod dag;
pub mod edge;
pub mod executor;

pub use dag::Graph;
pub use edge::Edge;
pub use executor::Executor;
