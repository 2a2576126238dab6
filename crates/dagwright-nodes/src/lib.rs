//! Leaf nodes and the declarative graph loader.

pub mod command;
pub mod loader;
pub mod registry;
pub mod user_input;

pub use command::CommandNode;
pub use loader::{
    load_graph_from_file, load_graph_from_str, EdgeSpec, GraphDefinition, GraphLoader,
    LoadedGraph, NodeSpec,
};
pub use registry::{NodeFactory, NodeRegistry};
pub use user_input::UserInputNode;
