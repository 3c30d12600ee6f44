//! Chat backend implementations
//!
//! [`ChatBackend`] abstracts an OpenAI-compatible chat-completions endpoint.
//! The production implementation streams SSE deltas; tests use scripted
//! backends. A backend instance is constructed inside the call frame that
//! resolved the credentials and dropped when that frame returns.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::prompt::{Message, Role, ToolCall, ToolDefinition};
use crate::LlmError;

/// Why a generation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    /// The model requested tool invocations; see [`ChatOutcome::tool_calls`].
    ToolUse,
    /// The receiver went away mid-stream.
    Cancelled,
}

/// A chat-completions request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

/// Final accumulated result of one streamed generation.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish: FinishReason,
}

/// Chat backend trait
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Stream a completion. Text deltas are sent through `tx` as they
    /// arrive; the accumulated outcome is returned at the end. A closed
    /// receiver cancels the generation.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, LlmError>;

    /// Model identifier, for logging.
    fn model_name(&self) -> &str;
}

/// Configuration for an OpenAI-compatible backend.
pub struct OpenAiConfig {
    /// Endpoint base, e.g. `https://api.openai.com/v1`
    pub base_url: String,
    pub model: String,
    pub api_key: Zeroizing<String>,
    pub timeout: Duration,
}

/// OpenAI-compatible backend.
///
/// Works with OpenAI, Azure-style gateways, vLLM, Ollama's compatible mode,
/// and anything else speaking the chat-completions SSE protocol.
pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, LlmError> {
        if config.base_url.is_empty() {
            return Err(LlmError::Configuration("base_url is required".into()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome, LlmError> {
        let wire_tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect();

        let wire_request = WireChatRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            temperature: Some(request.temperature),
            max_tokens: request.max_tokens,
            stream: true,
            tools: if wire_tools.is_empty() {
                None
            } else {
                Some(wire_tools)
            },
        };

        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(self.config.api_key.as_str())
            .json(&wire_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, body)));
        }

        let mut full_text = String::new();
        let mut pending_tools: Vec<PendingToolCall> = Vec::new();
        let mut finish = FinishReason::Stop;
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Network(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Process complete SSE lines
            while let Some(line_end) = buffer.find('\n') {
                let line = buffer[..line_end].trim().to_string();
                buffer.drain(..=line_end);

                if line.is_empty() || line == "data: [DONE]" {
                    continue;
                }
                let Some(json_str) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(frame) = serde_json::from_str::<WireStreamChunk>(json_str) else {
                    continue;
                };
                let Some(choice) = frame.choices.into_iter().next() else {
                    continue;
                };

                if let Some(delta) = choice.delta {
                    if let Some(content) = delta.content {
                        if !content.is_empty() {
                            full_text.push_str(&content);
                            if tx.send(content).await.is_err() {
                                finish = FinishReason::Cancelled;
                                break 'outer;
                            }
                        }
                    }
                    for fragment in delta.tool_calls.unwrap_or_default() {
                        accumulate_tool_delta(&mut pending_tools, fragment);
                    }
                }

                match choice.finish_reason.as_deref() {
                    Some("tool_calls") => finish = FinishReason::ToolUse,
                    Some("length") => finish = FinishReason::Length,
                    _ => {}
                }
            }
        }

        let tool_calls = pending_tools
            .into_iter()
            .map(PendingToolCall::finalize)
            .collect::<Result<Vec<_>, _>>()?;

        if !tool_calls.is_empty() && finish == FinishReason::Stop {
            finish = FinishReason::ToolUse;
        }

        Ok(ChatOutcome {
            text: full_text,
            tool_calls,
            finish,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Tool-call deltas arrive fragmented across SSE frames, keyed by index.
#[derive(Debug, Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments_json: String,
}

impl PendingToolCall {
    fn finalize(self) -> Result<ToolCall, LlmError> {
        let arguments: Value = if self.arguments_json.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            serde_json::from_str(&self.arguments_json).map_err(|e| {
                LlmError::InvalidResponse(format!("bad tool arguments: {}", e))
            })?
        };
        Ok(ToolCall {
            id: self.id,
            name: self.name,
            arguments,
        })
    }
}

fn accumulate_tool_delta(pending: &mut Vec<PendingToolCall>, fragment: WireToolCallDelta) {
    let index = fragment.index.unwrap_or(0) as usize;
    while pending.len() <= index {
        pending.push(PendingToolCall::default());
    }
    let slot = &mut pending[index];
    if let Some(id) = fragment.id {
        slot.id = id;
    }
    if let Some(function) = fragment.function {
        if let Some(name) = function.name {
            slot.name = name;
        }
        if let Some(arguments) = function.arguments {
            slot.arguments_json.push_str(&arguments);
        }
    }
}

// OpenAI wire types

#[derive(Debug, Serialize)]
struct WireChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireAssistantToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role: role.to_string(),
            content: msg.content.clone(),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|c| WireAssistantToolCall {
                        id: c.id.clone(),
                        kind: "function",
                        function: WireFunctionCall {
                            name: c.name.clone(),
                            arguments: c.arguments.to_string(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize)]
struct WireAssistantToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireStreamChunk {
    choices: Vec<WireStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct WireStreamChoice {
    delta: Option<WireDelta>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCallDelta {
    index: Option<u32>,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_requires_base_url() {
        let config = OpenAiConfig {
            base_url: String::new(),
            model: "m".into(),
            api_key: Zeroizing::new("k".into()),
            timeout: Duration::from_secs(5),
        };
        assert!(OpenAiBackend::new(config).is_err());
    }

    #[test]
    fn test_chat_url() {
        let backend = OpenAiBackend::new(OpenAiConfig {
            base_url: "https://api.example.com/v1/".into(),
            model: "m".into(),
            api_key: Zeroizing::new("k".into()),
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(backend.chat_url(), "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn test_request_serialization_includes_tools() {
        let request = WireChatRequest {
            model: "m".into(),
            messages: vec![WireMessage::from(&Message::user("hi"))],
            temperature: Some(0.7),
            max_tokens: None,
            stream: true,
            tools: Some(vec![WireTool {
                kind: "function",
                function: WireFunction {
                    name: "search_knowledge".into(),
                    description: "look things up".into(),
                    parameters: serde_json::json!({"type": "object"}),
                },
            }]),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""type":"function""#));
        assert!(json.contains("search_knowledge"));
        assert!(!json.contains("max_tokens"));
    }

    #[test]
    fn test_tool_delta_accumulation() {
        let mut pending = Vec::new();
        accumulate_tool_delta(
            &mut pending,
            WireToolCallDelta {
                index: Some(0),
                id: Some("call_1".into()),
                function: Some(WireFunctionDelta {
                    name: Some("search_knowledge".into()),
                    arguments: Some(r#"{"query":"secret"#.into()),
                }),
            },
        );
        accumulate_tool_delta(
            &mut pending,
            WireToolCallDelta {
                index: Some(0),
                id: None,
                function: Some(WireFunctionDelta {
                    name: None,
                    arguments: Some(r#" code"}"#.into()),
                }),
            },
        );

        let calls: Vec<ToolCall> = pending
            .into_iter()
            .map(|p| p.finalize().unwrap())
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search_knowledge");
        assert_eq!(calls[0].arguments["query"], "secret code");
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let raw = r#"{"choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: WireStreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(
            chunk.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("Hel")
        );

        let done = r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#;
        let chunk: WireStreamChunk = serde_json::from_str(done).unwrap();
        assert_eq!(chunk.choices[0].finish_reason.as_deref(), Some("tool_calls"));
    }
}
