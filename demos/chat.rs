//! Interactive chat REPL against a scripted offline model.
//!
//! The scripted model "reasons", asks for the `get_weather` tool, then
//! answers from the tool result, exercising the full streaming loop without
//! any network access.
//!
//! Usage:
//!   cargo run --example chat
//!   cargo run --example chat -- --text-tool-calls --show-thinking
//!   cargo run --example chat -- --cumulative --max-rounds 1
//!
//! Ctrl-C or type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::time::Duration;

use agent_core::{
    Agent, AgentConfig, Completion, CompletionDelta, CompletionRequest, DeltaMode, DeltaStream,
    FinishReason, LlmClient, LlmError, Message, Role, StreamEvent, TokenUsage, ToolCallDelta,
    ToolHandler, ToolOutcome, ToolRegistry,
};
use async_trait::async_trait;
use clap::Parser;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a scripted tool-calling model")]
struct Cli {
    /// Max tool rounds per message
    #[arg(long, default_value_t = 5)]
    max_rounds: usize,

    /// Emit tool calls as <tool_call> text instead of structured calls
    #[arg(long)]
    text_tool_calls: bool,

    /// Stream cumulative text instead of increments
    #[arg(long)]
    cumulative: bool,

    /// Print reasoning spans
    #[arg(long)]
    show_thinking: bool,

    /// Delay between streamed chunks, in milliseconds
    #[arg(long, default_value_t = 30)]
    chunk_delay_ms: u64,
}

/// Plays a weather assistant. First turn: think, then call `get_weather`.
/// After a tool result: answer from it.
struct ScriptedModel {
    text_tool_calls: bool,
    cumulative: bool,
    chunk_delay: Duration,
}

impl ScriptedModel {
    fn respond(&self, request: &CompletionRequest) -> Completion {
        let messages = &request.messages;
        let last = messages.last();
        // Answer once a tool result is in, or when tools were withdrawn.
        let latest_tool = messages.iter().rev().find(|m| m.role == Role::Tool);
        let answer_now = last.is_some_and(|m| m.role == Role::Tool) || request.tools.is_empty();
        if let Some(tool) = latest_tool.filter(|_| answer_now) {
            let temp = serde_json::from_str::<Value>(&tool.content)
                .ok()
                .and_then(|v| v["tempC"].as_i64());
            let content = match temp {
                Some(t) => format!("<think>The tool says {t}°C.</think>It's {t}°C right now."),
                None => format!("I couldn't get the weather: {}", tool.content),
            };
            return Completion {
                content,
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
                usage: Some(TokenUsage::new(60, 12)),
            };
        }

        let question = last.map(|m| m.content.as_str()).unwrap_or_default();
        let city = question
            .split_whitespace()
            .last()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
            .filter(|w| !w.is_empty())
            .unwrap_or("Paris")
            .to_string();
        let arguments = json!({ "city": city }).to_string();
        let thinking = format!("<think>The user asked about {city}; I need the weather tool.</think>");

        if self.text_tool_calls {
            Completion {
                content: format!(
                    "{thinking}Checking.<tool_call>{}</tool_call>",
                    json!({"name": "get_weather", "arguments": {"city": city}})
                ),
                finish_reason: FinishReason::Stop,
                tool_calls: vec![],
                usage: Some(TokenUsage::new(40, 20)),
            }
        } else {
            Completion {
                content: format!("{thinking}Checking."),
                finish_reason: FinishReason::ToolCalls,
                tool_calls: vec![agent_core::ToolCall::new("call_weather", "get_weather", arguments)],
                usage: Some(TokenUsage::new(40, 20)),
            }
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        Ok(self.respond(&request))
    }

    async fn stream(&self, request: CompletionRequest) -> Result<DeltaStream, LlmError> {
        let completion = self.respond(&request);
        let chars: Vec<char> = completion.content.chars().collect();
        let mut sent = String::new();
        let mut deltas = Vec::new();
        for chunk in chars.chunks(5) {
            let piece: String = chunk.iter().collect();
            sent.push_str(&piece);
            let content = if self.cumulative { sent.clone() } else { piece };
            deltas.push(CompletionDelta::text(content));
        }
        deltas.push(CompletionDelta {
            tool_calls: completion
                .tool_calls
                .into_iter()
                .enumerate()
                .map(|(index, call)| ToolCallDelta {
                    index,
                    id: Some(call.id),
                    name: Some(call.name),
                    arguments: call.arguments,
                    signature: None,
                })
                .collect(),
            finish_reason: Some(completion.finish_reason),
            usage: completion.usage,
            ..Default::default()
        });

        let delay = self.chunk_delay;
        let stream = futures::stream::iter(deltas).then(move |delta| async move {
            tokio::time::sleep(delay).await;
            Ok(delta)
        });
        Ok(stream.boxed())
    }

    fn delta_mode(&self) -> DeltaMode {
        if self.cumulative {
            DeltaMode::Cumulative
        } else {
            DeltaMode::Incremental
        }
    }
}

struct Weather;

#[async_trait]
impl ToolHandler for Weather {
    async fn call(&self, input: &Value) -> ToolOutcome {
        let city = input["city"].as_str().ok_or("city is required")?;
        let temp = city.bytes().map(i64::from).sum::<i64>() % 35;
        Ok(json!({ "city": city, "tempC": temp }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let model = ScriptedModel {
        text_tool_calls: cli.text_tool_calls,
        cumulative: cli.cumulative,
        chunk_delay: Duration::from_millis(cli.chunk_delay_ms),
    };
    let registry = ToolRegistry::new().add(
        "get_weather",
        "Current temperature for a city",
        json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        }),
        Weather,
    );
    let config = AgentConfig {
        max_rounds: cli.max_rounds,
        ..AgentConfig::default()
    };
    let agent = Agent::with_registry(model, registry, config)
        .with_system_prompt("You are a concise weather assistant.");

    eprintln!("agent-core chat (scripted model)");
    eprintln!("max rounds: {}", cli.max_rounds);
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut history: Vec<Message> = Vec::new();
    let show_thinking = cli.show_thinking;

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        let (tx, mut rx) = tokio::sync::mpsc::channel::<StreamEvent>(64);

        // Spawn a task to print events as they arrive
        let printer = tokio::spawn(async move {
            let mut answering = false;
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::Think {
                        content,
                        duration_ms,
                        ..
                    } => {
                        if show_thinking {
                            match duration_ms {
                                Some(ms) => eprintln!("\x1b[2;3m  (thought for {ms}ms)\x1b[0m"),
                                None => eprint!("\x1b[2;3m{content}\x1b[0m"),
                            }
                        }
                    }
                    StreamEvent::Content { content } => {
                        if !answering {
                            eprint!("\x1b[1;32magent>\x1b[0m ");
                            answering = true;
                        }
                        print!("{content}");
                        io::stdout().flush().ok();
                    }
                    StreamEvent::Replace { content } => {
                        println!("\n\x1b[1;32magent (revised)>\x1b[0m {content}");
                    }
                    StreamEvent::ToolStarted {
                        name, parameters, ..
                    } => {
                        if answering {
                            println!();
                            answering = false;
                        }
                        eprintln!("\x1b[33m  [tool: {name}]\x1b[0m {parameters}");
                    }
                    StreamEvent::ToolFinished {
                        name,
                        output,
                        is_error,
                        ..
                    } => {
                        let tag = if is_error { "error" } else { "result" };
                        eprintln!("\x1b[33m  [{tag}: {name}]\x1b[0m {output}");
                    }
                    StreamEvent::Done { usage } => {
                        println!();
                        eprintln!(
                            "\x1b[2m  [{}in / {}out tokens]\x1b[0m",
                            usage.prompt_tokens, usage.completion_tokens
                        );
                    }
                    StreamEvent::Error { message } => {
                        eprintln!("\x1b[1;31merror:\x1b[0m {message}");
                    }
                    StreamEvent::RoundStart { .. } => {}
                }
            }
        });

        let cancel = CancellationToken::new();
        let result = agent.execute_stream(trimmed, &history, &cancel, tx).await;
        printer.await.ok();

        if let Ok(result) = result {
            if result.rounds > 0 {
                eprintln!(
                    "\x1b[2m  ({} tool rounds: {})\x1b[0m",
                    result.rounds,
                    result.tools_used.join(", ")
                );
            }
            history.push(Message::user(trimmed));
            history.push(Message::assistant(result.content));
        }
    }

    eprintln!("bye.");
}
