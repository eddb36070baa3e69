pub mod handler;
pub mod registry;

pub use handler::{ToolDef, ToolExecutor, ToolHandler, ToolOutcome};
pub use registry::ToolRegistry;
