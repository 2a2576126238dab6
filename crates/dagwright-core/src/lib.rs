pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use error::{DagError, Result};
pub use event::{EventBus, EventRecord, GraphEvent};
pub use traits::{EventSink, Node};
pub use types::*;
