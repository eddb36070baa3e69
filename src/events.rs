use serde_json::Value;

use crate::types::TokenUsage;

/// Events emitted during a streaming run, in order. Every run ends with
/// either `Done` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    RoundStart {
        round: usize,
    },
    Content {
        content: String,
    },
    /// Reasoning text. The event closing a span has empty `content` and
    /// carries the span's measured duration.
    Think {
        tag: String,
        content: String,
        duration_ms: Option<u64>,
    },
    /// The answer shown so far must be replaced by `content`.
    Replace {
        content: String,
    },
    ToolStarted {
        id: String,
        name: String,
        parameters: Value,
    },
    ToolFinished {
        id: String,
        name: String,
        output: String,
        is_error: bool,
    },
    Done {
        usage: TokenUsage,
    },
    Error {
        message: String,
    },
}
