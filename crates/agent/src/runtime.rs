//! Persona runtime
//!
//! Drives one persona's streamed reply: prompt composition, the optional
//! knowledge-search tool loop, chunk forwarding, and cooperative
//! cancellation. Persistence decisions stay with the orchestrator; the
//! runtime only produces text.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use parley_core::{Message as LogMessage, Persona};
use parley_llm::{ChatBackend, ChatOutcome, ChatRequest, FinishReason, Message, ToolDefinition};

use crate::tools::{AgentTool, ToolContext};
use crate::AgentError;

/// Tool rounds before the runtime forces a plain completion.
const MAX_TOOL_ROUNDS: usize = 2;

/// Whether the invocation advertises the knowledge-search tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Direct,
    Retrieval,
}

/// Everything needed to generate one persona reply.
pub struct Invocation {
    pub persona: Persona,
    /// History window, oldest first, already bounded by `memory_window`.
    pub history: Vec<LogMessage>,
    /// Sender handle of the triggering message.
    pub user_sender: String,
    /// Content of the triggering message.
    pub user_message: String,
    pub mode: RuntimeMode,
    pub temperature: f32,
}

/// Persona runtime bound to one chat backend instance.
pub struct PersonaRuntime {
    backend: Arc<dyn ChatBackend>,
}

impl PersonaRuntime {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    /// Stream a reply. Chunks flow through `chunk_tx` in generation order;
    /// the assembled full text is returned at the end, so
    /// `join(chunks) == returned text` holds for committed replies.
    ///
    /// Cancellation: when `cancel` flips to true the in-flight generation is
    /// dropped and `AgentError::Cancelled` is returned promptly.
    pub async fn stream_reply(
        &self,
        invocation: &Invocation,
        tools: &[Arc<dyn AgentTool>],
        tool_ctx: &ToolContext,
        mut cancel: watch::Receiver<bool>,
        chunk_tx: mpsc::Sender<String>,
    ) -> Result<String, AgentError> {
        let mut messages = compose_messages(invocation);
        let definitions: Vec<ToolDefinition> = match invocation.mode {
            RuntimeMode::Retrieval => tools.iter().map(|t| t.definition()).collect(),
            RuntimeMode::Direct => Vec::new(),
        };

        // Everything sent through `chunk_tx`, across tool rounds, in order.
        // The returned reply is exactly this accumulation, preserving the
        // join(chunks) == reply round trip.
        let mut streamed = String::new();
        let mut rounds = 0;
        loop {
            // The final round withdraws the tools so the model must answer.
            let offer_tools = rounds < MAX_TOOL_ROUNDS && !definitions.is_empty();
            let request = ChatRequest {
                messages: messages.clone(),
                tools: if offer_tools {
                    definitions.clone()
                } else {
                    Vec::new()
                },
                temperature: invocation.temperature,
                max_tokens: None,
            };

            let outcome = tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => return Err(AgentError::Cancelled),
                result = self.backend.stream_chat(request, chunk_tx.clone()) => result?,
            };

            match outcome {
                ChatOutcome {
                    finish: FinishReason::Cancelled,
                    ..
                } => return Err(AgentError::Cancelled),
                ChatOutcome {
                    finish: FinishReason::ToolUse,
                    tool_calls,
                    text,
                } if !tool_calls.is_empty() && offer_tools => {
                    rounds += 1;
                    if !text.is_empty() {
                        streamed.push_str(&text);
                        messages.push(Message::assistant(text));
                    }
                    messages.push(Message::assistant_tool_calls(tool_calls.clone()));
                    for call in tool_calls {
                        let result = self.run_tool(tools, tool_ctx, &call.name, call.arguments).await;
                        let rendered = match result {
                            Ok(text) => text,
                            // Tool failures are reported to the model, which
                            // can still answer without the lookup.
                            Err(e) => format!("tool failed: {}", e),
                        };
                        messages.push(Message::tool_result(call.id, rendered));
                    }
                }
                ChatOutcome { text, .. } => {
                    streamed.push_str(&text);
                    return Ok(streamed);
                }
            }
        }
    }

    async fn run_tool(
        &self,
        tools: &[Arc<dyn AgentTool>],
        ctx: &ToolContext,
        name: &str,
        args: serde_json::Value,
    ) -> Result<String, AgentError> {
        let tool = tools
            .iter()
            .find(|t| t.definition().name == name)
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))?;
        tracing::debug!(tool = name, persona_id = %ctx.persona_id, "Running tool");
        tool.execute(ctx, args).await
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender dropped without cancelling; park forever and let the
            // generation finish.
            std::future::pending::<()>().await;
        }
    }
}

/// Build the prompt: system message, windowed history, triggering message.
fn compose_messages(invocation: &Invocation) -> Vec<Message> {
    let mut messages = Vec::with_capacity(invocation.history.len() + 2);
    messages.push(Message::system(compose_system_prompt(&invocation.persona)));

    let window = invocation.persona.memory_window as usize;
    let skip = invocation.history.len().saturating_sub(window);
    for entry in invocation.history.iter().skip(skip) {
        messages.push(Message::user(format!("{}: {}", entry.sender, entry.content)));
    }

    messages.push(Message::user(format!(
        "{}: {}",
        invocation.user_sender, invocation.user_message
    )));
    messages
}

fn compose_system_prompt(persona: &Persona) -> String {
    let mut prompt = persona.system_prompt.trim().to_string();

    if !persona.tone.trim().is_empty() {
        prompt.push_str(&format!("\n\nTone: {}.", persona.tone.trim()));
    }

    prompt.push_str(&format!(
        "\n\nYou are {handle} ({name}), one participant in a group conversation with a \
         human and other assistants. Messages are prefixed with their sender's handle. \
         Reply only as {handle}, without prefixing your own handle. Speak only for \
         yourself, keep replies conversational, and do not answer on behalf of other \
         participants.",
        handle = persona.handle,
        name = persona.display_name,
    ));

    prompt
}
