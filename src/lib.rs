pub mod demux;
pub mod error;
pub mod events;
pub mod fallback;
pub mod llm;
pub mod tools;
pub mod types;

mod run;
mod stream;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use demux::{classify, strip_reasoning, Mode, Segment, TagDemux};
pub use error::{AgentError, LlmError};
pub use events::StreamEvent;
pub use fallback::{
    contains_tool_call_markup, extract_tool_calls, strip_tool_call_markup, FALLBACK_ID_PREFIX,
};
pub use llm::{DeltaMode, DeltaStream, LlmClient};
pub use stream::NATIVE_REASONING_TAG;
pub use tools::{ToolExecutor, ToolHandler, ToolOutcome, ToolRegistry};
pub use types::{
    Completion, CompletionDelta, CompletionRequest, FinishReason, GenerationOptions, Message,
    Role, TokenUsage, ToolCall, ToolCallDelta, ToolSpec,
};

use run::{final_step, next_step, Emitter, ModelTurn, RunState, Step};

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Tool rounds before the model is forced to answer without tools.
    pub max_rounds: usize,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub system_prompt: String,
    /// Appended as a user message when the round budget runs out.
    pub final_answer_instruction: String,
    /// Tool-role content for a failed call. `{name}` and `{error}` are substituted.
    pub tool_error_template: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 5,
            temperature: None,
            max_tokens: None,
            system_prompt: String::new(),
            final_answer_instruction: "You have used all available tool rounds. Do not call any \
                more tools. Answer the user's last message now using the information gathered \
                so far."
                .into(),
            tool_error_template: "Error executing tool {name}: {error}".into(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_rounds == 0 {
            return Err(AgentError::Config("max_rounds must be at least 1".into()));
        }
        Ok(())
    }
}

/// Result of an agent run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResult {
    pub content: String,
    /// Distinct tool names, in first-use order.
    pub tools_used: Vec<String>,
    /// Tool rounds actually executed.
    pub rounds: usize,
    pub usage: TokenUsage,
    pub cancelled: bool,
}

/// The agent. Wire up an LLM client, a tool executor and its catalog, and go.
///
/// Every call to [`Agent::execute`] or [`Agent::execute_stream`] owns its own
/// transcript, usage counters and demultiplexer, so one agent can serve
/// concurrent runs.
pub struct Agent {
    client: Box<dyn LlmClient>,
    executor: Box<dyn ToolExecutor>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        client: impl LlmClient + 'static,
        executor: impl ToolExecutor + 'static,
        tools: Vec<ToolSpec>,
        config: AgentConfig,
    ) -> Self {
        Self {
            client: Box::new(client),
            executor: Box::new(executor),
            tools,
            config,
        }
    }

    /// Agent whose catalog and executor are the same registry.
    pub fn with_registry(
        client: impl LlmClient + 'static,
        registry: ToolRegistry,
        config: AgentConfig,
    ) -> Self {
        let tools = registry.specs();
        Self::new(client, registry, tools, config)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = prompt.into();
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run to completion and return the final answer.
    pub async fn execute(
        &self,
        message: &str,
        history: &[Message],
        cancel: &CancellationToken,
    ) -> Result<AgentResult, AgentError> {
        self.config.validate()?;
        let mut run = RunState::new(&self.config.system_prompt, history, message);

        if cancel.is_cancelled() {
            info!("agent cancelled before start");
            return Ok(run.cancelled(""));
        }
        info!(max_rounds = self.config.max_rounds, tools = self.tools.len(), "agent run started");

        while run.rounds < self.config.max_rounds {
            if cancel.is_cancelled() {
                info!(round = run.rounds, "agent cancelled");
                return Ok(run.cancelled(""));
            }

            info!(round = run.rounds, "agent round");
            let completion = self
                .client
                .complete(self.request(&run, true, cancel))
                .await?;
            run.record_usage(completion.usage);

            match next_step(ModelTurn::from(completion))? {
                Step::Answer(text) => {
                    info!(rounds = run.rounds, "agent finished");
                    return Ok(run.finish(&text));
                }
                Step::Tools(calls) => {
                    run.execute_tools(
                        self.executor.as_ref(),
                        calls,
                        &self.config.tool_error_template,
                        Emitter::none(),
                    )
                    .await;
                }
            }
        }

        warn!(max_rounds = self.config.max_rounds, "tool round budget exhausted, forcing final answer");
        run.push_final_instruction(&self.config.final_answer_instruction);
        if cancel.is_cancelled() {
            info!(round = run.rounds, "agent cancelled");
            return Ok(run.cancelled(""));
        }

        let completion = self
            .client
            .complete(self.request(&run, false, cancel))
            .await?;
        run.record_usage(completion.usage);
        let text = final_step(ModelTurn::from(completion))?;
        info!(rounds = run.rounds, "agent finished");
        Ok(run.finish(&text))
    }

    /// Run to completion, forwarding progress events to `tx` as they happen.
    /// The last event is always `Done` or `Error`.
    pub async fn execute_stream(
        &self,
        message: &str,
        history: &[Message],
        cancel: &CancellationToken,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<AgentResult, AgentError> {
        let emitter = Emitter::new(&tx);
        match self.stream_loop(message, history, cancel, emitter).await {
            Ok(result) => {
                emitter.send(StreamEvent::Done { usage: result.usage }).await;
                Ok(result)
            }
            Err(e) => {
                emitter
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn stream_loop(
        &self,
        message: &str,
        history: &[Message],
        cancel: &CancellationToken,
        emitter: Emitter<'_>,
    ) -> Result<AgentResult, AgentError> {
        self.config.validate()?;
        let mut run = RunState::new(&self.config.system_prompt, history, message);

        if cancel.is_cancelled() {
            info!("agent cancelled before start");
            return Ok(run.cancelled(""));
        }
        info!(max_rounds = self.config.max_rounds, tools = self.tools.len(), "streaming agent run started");

        while run.rounds < self.config.max_rounds {
            if cancel.is_cancelled() {
                info!(round = run.rounds, "agent cancelled");
                return Ok(run.cancelled(""));
            }

            info!(round = run.rounds, "agent round");
            emitter.send(StreamEvent::RoundStart { round: run.rounds }).await;
            let streamed = stream::stream_round(
                self.client.as_ref(),
                self.request(&run, true, cancel),
                cancel,
                emitter,
            )
            .await?;
            run.record_usage(streamed.usage);

            if streamed.cancelled {
                return Ok(run.cancelled(&streamed.shown));
            }

            match next_step(streamed.turn)? {
                Step::Answer(text) => {
                    stream::reconcile(&streamed.shown, &text, emitter).await;
                    info!(rounds = run.rounds, "agent finished");
                    return Ok(run.finish(&text));
                }
                Step::Tools(calls) => {
                    run.execute_tools(
                        self.executor.as_ref(),
                        calls,
                        &self.config.tool_error_template,
                        emitter,
                    )
                    .await;
                }
            }
        }

        warn!(max_rounds = self.config.max_rounds, "tool round budget exhausted, forcing final answer");
        run.push_final_instruction(&self.config.final_answer_instruction);
        if cancel.is_cancelled() {
            info!(round = run.rounds, "agent cancelled");
            return Ok(run.cancelled(""));
        }

        emitter.send(StreamEvent::RoundStart { round: run.rounds }).await;
        let streamed = stream::stream_round(
            self.client.as_ref(),
            self.request(&run, false, cancel),
            cancel,
            emitter,
        )
        .await?;
        run.record_usage(streamed.usage);
        if streamed.cancelled {
            return Ok(run.cancelled(&streamed.shown));
        }

        let text = final_step(streamed.turn)?;
        stream::reconcile(&streamed.shown, &text, emitter).await;
        info!(rounds = run.rounds, "agent finished");
        Ok(run.finish(&text))
    }

    fn request(&self, run: &RunState, with_tools: bool, cancel: &CancellationToken) -> CompletionRequest {
        CompletionRequest {
            messages: run.transcript.clone(),
            tools: if with_tools { self.tools.clone() } else { Vec::new() },
            options: GenerationOptions {
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
                cancel: cancel.clone(),
            },
        }
    }
}
