use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::LlmError;
use crate::types::{Completion, CompletionDelta, CompletionRequest};

/// Ordered deltas of one streamed completion.
pub type DeltaStream = BoxStream<'static, Result<CompletionDelta, LlmError>>;

/// How a backend's streamed `content` relates to what it sent before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeltaMode {
    /// Each delta carries only new text.
    #[default]
    Incremental,
    /// Each delta carries the full text generated so far.
    Cumulative,
}

/// Pure LLM call. No state, no history, no provider branching on the
/// caller's side. Implemented once per backend.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError>;

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream, LlmError>;

    fn delta_mode(&self) -> DeltaMode {
        DeltaMode::Incremental
    }
}

/// Blanket impl so `Box<dyn LlmClient>` can be passed directly to `Agent::new()`.
#[async_trait]
impl LlmClient for Box<dyn LlmClient> {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        (**self).complete(request).await
    }

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream, LlmError> {
        (**self).stream(request).await
    }

    fn delta_mode(&self) -> DeltaMode {
        (**self).delta_mode()
    }
}
