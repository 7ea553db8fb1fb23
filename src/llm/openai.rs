//! OpenAI-compatible chat-completions provider
//!
//! Talks to any server speaking the `/v1/chat/completions` wire format.
//! Requests are always streamed so answer tokens can be surfaced while the
//! response is still in flight.

use super::types::*;
use super::{LlmError, LlmService};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible service implementation
pub struct OpenAiService {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiService {
    pub fn new(api_key: String, model: String, base_url: Option<&str>) -> Self {
        // An override is a prefix like "https://gateway.example/v1"; the
        // endpoint path is appended unless it is already there
        let base_url = match base_url {
            Some(url) => {
                let url = url.trim_end_matches('/');
                if url.ends_with("/chat/completions") {
                    url.to_string()
                } else {
                    format!("{url}/chat/completions")
                }
            }
            None => DEFAULT_BASE_URL.to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_key,
            model,
            base_url,
        }
    }

    fn translate_request(&self, request: &LlmRequest) -> OpenAiRequest {
        let mut messages = Vec::new();

        if let Some(system) = &request.system {
            messages.push(OpenAiMessage {
                role: "system",
                content: Some(system.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &request.messages {
            translate_message(msg, &mut messages);
        }

        let tools: Vec<OpenAiTool> = request
            .tools
            .iter()
            .map(|t| OpenAiTool {
                r#type: "function",
                function: OpenAiFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect();

        OpenAiRequest {
            model: self.model.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            messages,
            tools: if tools.is_empty() { None } else { Some(tools) },
        }
    }

    fn classify_error(&self, status: reqwest::StatusCode, body: &str) -> LlmError {
        // Prefer the upstream error message when the body is the usual
        // `{"error": {"message": ...}}` envelope
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .map(String::from)
            })
            .unwrap_or_else(|| body.to_string());

        match status.as_u16() {
            401 | 403 => LlmError::auth(format!("Authentication failed: {message}")),
            429 => LlmError::rate_limit(format!("Rate limited: {message}")),
            400 => LlmError::invalid_request(format!("Invalid request: {message}")),
            500..=599 => LlmError::server_error(format!("Server error: {message}")),
            _ => LlmError::unknown(format!("HTTP {status}: {message}")),
        }
    }
}

#[async_trait]
impl LlmService for OpenAiService {
    async fn complete(
        &self,
        request: &LlmRequest,
        sink: &TokenSink,
    ) -> Result<LlmResponse, LlmError> {
        let payload = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_error(status, &body));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut acc = StreamAccumulator::default();

        'read: while let Some(chunk) = stream.next().await {
            let bytes =
                chunk.map_err(|e| LlmError::network(format!("Stream interrupted: {e}")))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(line) = drain_line(&mut buffer) {
                let Some(data) = parse_data_line(&line) else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(parsed) => acc.apply(&parsed, sink),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unparseable stream chunk");
                    }
                }
            }
        }

        Ok(acc.finish())
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Flatten one of our messages into wire messages.
///
/// Tool results travel as dedicated `role: "tool"` messages on this wire
/// format, so a single history message may expand into several entries.
fn translate_message(msg: &LlmMessage, out: &mut Vec<OpenAiMessage>) {
    match msg.role {
        MessageRole::User => {
            let mut text_parts = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.as_str()),
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let content = if *is_error {
                            format!("Error: {content}")
                        } else {
                            content.clone()
                        };
                        out.push(OpenAiMessage {
                            role: "tool",
                            content: Some(content),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                    ContentBlock::ToolUse { .. } => {}
                }
            }
            if !text_parts.is_empty() {
                out.push(OpenAiMessage {
                    role: "user",
                    content: Some(text_parts.join("\n")),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
        MessageRole::Assistant => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();
            for block in &msg.content {
                match block {
                    ContentBlock::Text { text } => text_parts.push(text.as_str()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(OpenAiToolCall {
                            id: id.clone(),
                            r#type: "function",
                            function: OpenAiFunctionCall {
                                name: name.clone(),
                                arguments: input.to_string(),
                            },
                        });
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }
            out.push(OpenAiMessage {
                role: "assistant",
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join("\n"))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            });
        }
    }
}

/// Pop one complete line off the front of the buffer
fn drain_line(buffer: &mut String) -> Option<String> {
    let pos = buffer.find('\n')?;
    let line: String = buffer.drain(..=pos).collect();
    Some(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Extract the payload of an SSE `data:` line
fn parse_data_line(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Accumulates stream chunks into a complete response.
///
/// Content deltas are forwarded to the sink as they arrive; tool-call
/// argument fragments are only assembled, never streamed as answer text.
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Usage,
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    fn apply(&mut self, chunk: &StreamChunk, sink: &TokenSink) {
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                sink.push(content);
                self.text.push_str(content);
            }
            for delta in choice.delta.tool_calls.iter().flatten() {
                if self.tool_calls.len() <= delta.index {
                    self.tool_calls
                        .resize_with(delta.index + 1, PartialToolCall::default);
                }
                let call = &mut self.tool_calls[delta.index];
                if let Some(id) = &delta.id {
                    call.id.push_str(id);
                }
                if let Some(function) = &delta.function {
                    if let Some(name) = &function.name {
                        call.name.push_str(name);
                    }
                    if let Some(arguments) = &function.arguments {
                        call.arguments.push_str(arguments);
                    }
                }
            }
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            };
        }
    }

    fn finish(self) -> LlmResponse {
        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::text(self.text));
        }
        for call in self.tool_calls {
            // Malformed argument JSON is passed through as-is; the tool's
            // own input validation reports it back to the model
            let input = if call.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&call.arguments)
                    .unwrap_or(serde_json::Value::String(call.arguments))
            };
            content.push(ContentBlock::tool_use(call.id, call.name, input));
        }

        LlmResponse {
            content,
            usage: self.usage,
        }
    }
}

// Wire types

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    stream_options: StreamOptions,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAiMessage {
    role: &'static str,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCall {
    id: String,
    r#type: &'static str,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    r#type: &'static str,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<UsagePayload>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize, Default)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}
