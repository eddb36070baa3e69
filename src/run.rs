use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::demux::strip_reasoning;
use crate::error::LlmError;
use crate::events::StreamEvent;
use crate::fallback::{contains_tool_call_markup, extract_tool_calls, strip_tool_call_markup};
use crate::tools::ToolExecutor;
use crate::types::{Completion, FinishReason, Message, TokenUsage, ToolCall};
use crate::AgentResult;

/// Optional event sink. The blocking loop runs with none.
#[derive(Clone, Copy)]
pub(crate) struct Emitter<'a> {
    tx: Option<&'a mpsc::Sender<StreamEvent>>,
}

impl<'a> Emitter<'a> {
    pub(crate) fn none() -> Self {
        Self { tx: None }
    }

    pub(crate) fn new(tx: &'a mpsc::Sender<StreamEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub(crate) async fn send(&self, event: StreamEvent) {
        if let Some(tx) = self.tx {
            let _ = tx.send(event).await;
        }
    }
}

/// What the model produced in one request, reduced to what the branching
/// logic needs.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelTurn {
    pub raw_text: String,
    pub finish_reason: FinishReason,
    pub tool_calls: Vec<ToolCall>,
}

impl From<Completion> for ModelTurn {
    fn from(completion: Completion) -> Self {
        Self {
            raw_text: completion.content,
            finish_reason: completion.finish_reason,
            tool_calls: completion.tool_calls,
        }
    }
}

/// Where the loop goes after a model turn.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Tools(Vec<ToolCall>),
    /// Sanitized answer text, not yet trimmed.
    Answer(String),
}

/// Decide the next step from a model turn. Structured calls win when the
/// finish reason asks for tools; otherwise tool-call markup in the text is
/// tried before settling on an answer.
pub(crate) fn next_step(turn: ModelTurn) -> Result<Step, LlmError> {
    check_finish(&turn)?;

    if turn.finish_reason == FinishReason::ToolCalls && !turn.tool_calls.is_empty() {
        return Ok(Step::Tools(turn.tool_calls));
    }

    if !turn.tool_calls.is_empty() {
        warn!(
            finish_reason = ?turn.finish_reason,
            count = turn.tool_calls.len(),
            "ignoring structured tool calls that contradict the finish reason"
        );
    }

    if contains_tool_call_markup(&turn.raw_text) {
        if let Some(calls) = extract_tool_calls(&turn.raw_text) {
            info!(count = calls.len(), "using tool calls recovered from text");
            return Ok(Step::Tools(calls));
        }
        warn!("tool-call markup present but no valid call recovered; answering");
    }

    Ok(Step::Answer(final_answer(&turn.raw_text)))
}

/// Answer of the forced final request. Tools were disabled for it, so any
/// tool calls it still makes are ignored.
pub(crate) fn final_step(turn: ModelTurn) -> Result<String, LlmError> {
    check_finish(&turn)?;
    if !turn.tool_calls.is_empty() || contains_tool_call_markup(&turn.raw_text) {
        warn!("ignoring tool calls in the final no-tools response");
    }
    Ok(final_answer(&turn.raw_text))
}

fn check_finish(turn: &ModelTurn) -> Result<(), LlmError> {
    if turn.finish_reason == FinishReason::Error {
        return Err(LlmError::Provider(format!(
            "model finished with an error: {}",
            final_answer(&turn.raw_text).trim()
        )));
    }
    Ok(())
}

/// Display text for a raw model response: tool-call blocks and reasoning
/// spans removed.
pub(crate) fn final_answer(raw: &str) -> String {
    strip_reasoning(&strip_tool_call_markup(raw))
}

pub(crate) fn render_tool_error(template: &str, name: &str, error: &str) -> String {
    template.replace("{name}", name).replace("{error}", error)
}

/// State owned by a single agent run.
pub(crate) struct RunState {
    pub transcript: Vec<Message>,
    pub usage: TokenUsage,
    pub tools_used: Vec<String>,
    pub rounds: usize,
}

impl RunState {
    pub(crate) fn new(system_prompt: &str, history: &[Message], user_message: &str) -> Self {
        let mut transcript = Vec::with_capacity(history.len() + 2);
        transcript.push(Message::system(system_prompt));
        transcript.extend_from_slice(history);
        transcript.push(Message::user(user_message));
        Self {
            transcript,
            usage: TokenUsage::default(),
            tools_used: Vec::new(),
            rounds: 0,
        }
    }

    pub(crate) fn record_usage(&mut self, usage: Option<TokenUsage>) {
        if let Some(usage) = usage {
            self.usage.accumulate(&usage);
        }
    }

    /// Run one round of tool calls, strictly in order, recording the
    /// assistant entry and one tool entry per call.
    pub(crate) async fn execute_tools(
        &mut self,
        executor: &dyn ToolExecutor,
        calls: Vec<ToolCall>,
        error_template: &str,
        emitter: Emitter<'_>,
    ) {
        info!(round = self.rounds, count = calls.len(), "executing tool calls");
        self.transcript
            .push(Message::assistant_tool_calls(calls.clone()));

        for call in calls {
            let parsed = parse_arguments(&call.arguments);
            let parameters = match &parsed {
                Ok(value) => value.clone(),
                Err(_) => Value::String(call.arguments.clone()),
            };
            emitter
                .send(StreamEvent::ToolStarted {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    parameters,
                })
                .await;

            let outcome = match parsed {
                Ok(arguments) => executor.execute(&call.name, &arguments).await,
                Err(e) => {
                    warn!(tool = %call.name, id = %call.id, error = %e, "malformed tool arguments");
                    Err(format!("invalid arguments: {e}"))
                }
            };

            let (output, is_error) = match outcome {
                Ok(value) => (value.to_string(), false),
                Err(error) => (render_tool_error(error_template, &call.name, &error), true),
            };
            debug!(tool = %call.name, is_error, "tool finished");

            emitter
                .send(StreamEvent::ToolFinished {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    output: output.clone(),
                    is_error,
                })
                .await;

            if !self.tools_used.contains(&call.name) {
                self.tools_used.push(call.name.clone());
            }
            self.transcript.push(Message::tool(call.id, output));
        }

        self.rounds += 1;
    }

    pub(crate) fn push_final_instruction(&mut self, instruction: &str) {
        self.transcript.push(Message::user(instruction));
    }

    pub(crate) fn finish(self, content: &str) -> AgentResult {
        AgentResult {
            content: content.trim().to_string(),
            tools_used: self.tools_used,
            rounds: self.rounds,
            usage: self.usage,
            cancelled: false,
        }
    }

    pub(crate) fn cancelled(self, content: &str) -> AgentResult {
        AgentResult {
            cancelled: true,
            ..self.finish(content)
        }
    }
}

/// Empty argument text means "no arguments".
fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolHandler, ToolOutcome, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    fn turn(text: &str, finish_reason: FinishReason, tool_calls: Vec<ToolCall>) -> ModelTurn {
        ModelTurn {
            raw_text: text.into(),
            finish_reason,
            tool_calls,
        }
    }

    #[test]
    fn structured_calls_with_tool_finish() {
        let calls = vec![ToolCall::new("c1", "f", "{}")];
        let step = next_step(turn("", FinishReason::ToolCalls, calls.clone())).unwrap();
        assert_eq!(step, Step::Tools(calls));
    }

    #[test]
    fn markup_fallback_when_finish_contradicts() {
        let text = r#"<tool_call>{"name":"f","arguments":{"a":1}}</tool_call>"#;
        let step = next_step(turn(text, FinishReason::Stop, vec![])).unwrap();
        match step {
            Step::Tools(calls) => {
                assert_eq!(calls[0].name, "f");
                assert_eq!(calls[0].arguments, r#"{"a":1}"#);
            }
            other => panic!("expected tools, got {other:?}"),
        }
    }

    #[test]
    fn failed_fallback_answers_with_sanitized_text() {
        let text = "Sorry.<tool_call>garbage</tool_call>";
        let step = next_step(turn(text, FinishReason::Stop, vec![])).unwrap();
        assert_eq!(step, Step::Answer("Sorry.".into()));
    }

    #[test]
    fn plain_answer_strips_reasoning() {
        let step = next_step(turn("<think>hm</think>Yes.", FinishReason::Stop, vec![])).unwrap();
        assert_eq!(step, Step::Answer("Yes.".into()));
    }

    #[test]
    fn error_finish_is_fatal() {
        let err = next_step(turn("boom", FinishReason::Error, vec![])).unwrap_err();
        assert!(matches!(err, LlmError::Provider(_)));
    }

    #[test]
    fn final_step_ignores_tool_calls() {
        let text = r#"Done.<tool_call>{"name":"f","arguments":{}}</tool_call>"#;
        let calls = vec![ToolCall::new("c1", "f", "{}")];
        let answer = final_step(turn(text, FinishReason::ToolCalls, calls)).unwrap();
        assert_eq!(answer, "Done.");
        assert!(final_step(turn("", FinishReason::Error, vec![])).is_err());
    }

    #[test]
    fn tool_error_template() {
        assert_eq!(
            render_tool_error("Error executing tool {name}: {error}", "f", "bad"),
            "Error executing tool f: bad"
        );
    }

    #[test]
    fn transcript_starts_with_system_history_user() {
        let history = vec![Message::user("hi"), Message::assistant("hello")];
        let run = RunState::new("sys", &history, "next");
        let roles: Vec<_> = run.transcript.iter().map(|m| m.role).collect();
        use crate::types::Role::*;
        assert_eq!(roles, vec![System, User, Assistant, User]);
        assert_eq!(run.transcript[3].content, "next");
    }

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, input: &Value) -> ToolOutcome {
            Ok(input.clone())
        }
    }

    #[tokio::test]
    async fn tool_round_records_transcript_in_order() {
        let registry = ToolRegistry::new().add("echo", "Echo", json!({}), Echo);
        let mut run = RunState::new("sys", &[], "go");
        let calls = vec![
            ToolCall::new("c1", "echo", r#"{"n":1}"#),
            ToolCall::new("c2", "echo", "{not json"),
            ToolCall::new("c3", "missing", ""),
        ];

        run.execute_tools(&registry, calls, "{name} failed: {error}", Emitter::none())
            .await;

        assert_eq!(run.rounds, 1);
        assert_eq!(run.tools_used, vec!["echo", "missing"]);
        let tail = &run.transcript[2..];
        assert_eq!(tail.len(), 4);
        assert_eq!(tail[0].tool_calls.len(), 3);
        assert!(tail[0].content.is_empty());
        assert_eq!(tail[1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tail[1].content, r#"{"n":1}"#);
        assert!(tail[2].content.starts_with("echo failed: invalid arguments"));
        assert_eq!(tail[3].content, "missing failed: unknown tool: missing");
    }

    #[tokio::test]
    async fn tool_round_emits_started_and_finished() {
        let registry = ToolRegistry::new().add("echo", "Echo", json!({}), Echo);
        let mut run = RunState::new("", &[], "go");
        let (tx, mut rx) = mpsc::channel(8);

        run.execute_tools(
            &registry,
            vec![ToolCall::new("c1", "echo", r#"{"x":1}"#)],
            "{error}",
            Emitter::new(&tx),
        )
        .await;

        assert_eq!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolStarted {
                id: "c1".into(),
                name: "echo".into(),
                parameters: json!({"x": 1}),
            }
        );
        assert!(matches!(
            rx.try_recv().unwrap(),
            StreamEvent::ToolFinished { is_error: false, .. }
        ));
    }
}
