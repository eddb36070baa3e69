use std::time::Instant;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::demux::{Segment, TagDemux};
use crate::error::LlmError;
use crate::events::StreamEvent;
use crate::llm::{DeltaMode, LlmClient};
use crate::run::{Emitter, ModelTurn};
use crate::types::{CompletionDelta, CompletionRequest, FinishReason, TokenUsage, ToolCall, ToolCallDelta};

/// Tag reported for text from a provider's dedicated reasoning channel.
pub const NATIVE_REASONING_TAG: &str = "reasoning";

/// Outcome of one streamed request.
#[derive(Debug, Default)]
pub(crate) struct StreamedTurn {
    pub turn: ModelTurn,
    pub usage: Option<TokenUsage>,
    /// Answer text the consumer has been shown for this request.
    pub shown: String,
    pub cancelled: bool,
}

/// Issue a streaming request and drain it. Cancellation is checked after
/// every delta; once seen, the stream is dropped without flushing.
pub(crate) async fn stream_round(
    client: &dyn LlmClient,
    request: CompletionRequest,
    cancel: &CancellationToken,
    emitter: Emitter<'_>,
) -> Result<StreamedTurn, LlmError> {
    let mut deltas = client.stream(request).await?;
    let mut round = RoundStream::new(client.delta_mode());

    while let Some(delta) = deltas.next().await {
        round.apply(delta?, emitter).await;
        if cancel.is_cancelled() {
            info!(received = round.received.len(), "cancelled mid-stream");
            return Ok(round.into_turn(true));
        }
    }

    let tail = round.demux.flush();
    round.forward(tail, emitter).await;
    Ok(round.into_turn(false))
}

/// Bring the displayed answer in line with the sanitized final text. Emits
/// only the unseen suffix when possible, otherwise replaces what was shown.
pub(crate) async fn reconcile(shown: &str, sanitized: &str, emitter: Emitter<'_>) {
    if shown == sanitized {
        return;
    }
    match sanitized.strip_prefix(shown) {
        Some(rest) => {
            debug!(len = rest.len(), "emitting unseen answer suffix");
            emitter
                .send(StreamEvent::Content {
                    content: rest.to_string(),
                })
                .await;
        }
        None => {
            warn!(
                shown_len = shown.len(),
                final_len = sanitized.len(),
                "sanitized answer diverges from streamed text; replacing displayed answer"
            );
            emitter
                .send(StreamEvent::Replace {
                    content: sanitized.to_string(),
                })
                .await;
        }
    }
}

struct RoundStream {
    mode: DeltaMode,
    demux: TagDemux,
    received: String,
    shown: String,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
    tool_calls: ToolCallAccumulator,
    think_started: Option<Instant>,
}

impl RoundStream {
    fn new(mode: DeltaMode) -> Self {
        Self {
            mode,
            demux: TagDemux::new(),
            received: String::new(),
            shown: String::new(),
            finish_reason: None,
            usage: None,
            tool_calls: ToolCallAccumulator::default(),
            think_started: None,
        }
    }

    async fn apply(&mut self, delta: CompletionDelta, emitter: Emitter<'_>) {
        if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
            emitter
                .send(StreamEvent::Think {
                    tag: NATIVE_REASONING_TAG.into(),
                    content: reasoning,
                    duration_ms: None,
                })
                .await;
        }

        if !delta.content.is_empty() {
            match self.mode {
                DeltaMode::Incremental => self.push_text(&delta.content, emitter).await,
                DeltaMode::Cumulative => self.push_cumulative(delta.content, emitter).await,
            }
        }

        for fragment in delta.tool_calls {
            self.tool_calls.merge(fragment);
        }
        if delta.finish_reason.is_some() {
            self.finish_reason = delta.finish_reason;
        }
        if delta.usage.is_some() {
            self.usage = delta.usage;
        }
    }

    async fn push_text(&mut self, text: &str, emitter: Emitter<'_>) {
        self.received.push_str(text);
        let segments = self.demux.push(text);
        self.forward(segments, emitter).await;
    }

    async fn push_cumulative(&mut self, full: String, emitter: Emitter<'_>) {
        if let Some(unseen) = full.strip_prefix(self.received.as_str()) {
            let unseen = unseen.to_string();
            if !unseen.is_empty() {
                self.push_text(&unseen, emitter).await;
            }
            return;
        }

        // The backend rewrote text it already sent. The new full text is
        // authoritative: rebuild from it, re-emit its reasoning and replace
        // the displayed answer.
        let open_tag = self.demux.think_tag().map(str::to_string);
        self.demux = TagDemux::new();
        let mut rebuilt = String::new();
        let mut spans = Vec::new();
        for segment in self.demux.push(&full) {
            match segment {
                Segment::Content(content) => rebuilt.push_str(&content),
                other => spans.push(other),
            }
        }
        warn!(
            previous_len = self.received.len(),
            new_len = full.len(),
            reasoning_len = spans
                .iter()
                .map(|s| match s {
                    Segment::Think { text, .. } => text.len(),
                    _ => 0,
                })
                .sum::<usize>(),
            "cumulative text does not extend previous text; replacing displayed answer"
        );
        self.received = full;

        // A span left open by the old text is closed unless the rewrite reopens it.
        let reopened = spans
            .iter()
            .any(|s| matches!(s, Segment::ThinkStart { .. }));
        if let (false, Some(tag)) = (reopened, open_tag) {
            spans.insert(0, Segment::ThinkEnd { tag });
        }
        self.forward(spans, emitter).await;

        self.shown = rebuilt;
        emitter
            .send(StreamEvent::Replace {
                content: self.shown.clone(),
            })
            .await;
    }

    async fn forward(&mut self, segments: Vec<Segment>, emitter: Emitter<'_>) {
        for segment in segments {
            match segment {
                Segment::Content(content) => {
                    self.shown.push_str(&content);
                    emitter.send(StreamEvent::Content { content }).await;
                }
                Segment::ThinkStart { tag } => {
                    debug!(tag = %tag, "reasoning span started");
                    // Kept when a rewrite reopens a span that was already running.
                    self.think_started.get_or_insert_with(Instant::now);
                }
                Segment::Think { tag, text } => {
                    emitter
                        .send(StreamEvent::Think {
                            tag,
                            content: text,
                            duration_ms: None,
                        })
                        .await;
                }
                Segment::ThinkEnd { tag } => {
                    let duration_ms = self
                        .think_started
                        .take()
                        .map(|start| start.elapsed().as_millis() as u64);
                    emitter
                        .send(StreamEvent::Think {
                            tag,
                            content: String::new(),
                            duration_ms,
                        })
                        .await;
                }
                Segment::ToolCallStart | Segment::ToolCallEnd => {
                    debug!("tool-call markup in stream");
                }
                Segment::ToolCall(_) => {}
            }
        }
    }

    fn into_turn(self, cancelled: bool) -> StreamedTurn {
        StreamedTurn {
            turn: ModelTurn {
                raw_text: self.received,
                finish_reason: self.finish_reason.unwrap_or_default(),
                tool_calls: self.tool_calls.finish(),
            },
            usage: self.usage,
            shown: self.shown,
            cancelled,
        }
    }
}

/// Merges streamed tool-call fragments by index, keeping first-seen order.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: Vec<(usize, ToolCall)>,
}

impl ToolCallAccumulator {
    fn merge(&mut self, fragment: ToolCallDelta) {
        let pos = match self.calls.iter().position(|(i, _)| *i == fragment.index) {
            Some(pos) => pos,
            None => {
                debug!(index = fragment.index, "tool call started in stream");
                self.calls
                    .push((fragment.index, ToolCall::new("", "", "")));
                self.calls.len() - 1
            }
        };

        let call = &mut self.calls[pos].1;
        if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
            call.id = id;
        }
        if let Some(name) = fragment.name.filter(|n| !n.is_empty()) {
            call.name = name;
        }
        call.arguments.push_str(&fragment.arguments);
        if fragment.signature.is_some() {
            call.signature = fragment.signature;
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
            .into_iter()
            .filter_map(|(index, mut call)| {
                if call.name.is_empty() {
                    warn!(index, "dropping streamed tool call without a name");
                    return None;
                }
                if call.id.is_empty() {
                    call.id = format!("call_{index}");
                }
                Some(call)
            })
            .collect()
    }
}
