//! Per-conversation turn executor
//!
//! Owns a conversation's turn state, interprets effects from the pure
//! transition function, and fans events out to SSE subscribers. One
//! executor task per conversation; everything for that conversation is
//! serialized through its event channel.

use super::traits::{Storage, ToolExecutor};
use super::SseEvent;
use crate::db::{ErrorKind, MessageContent, ToolContent, ToolResult, UserContent};
use crate::llm::{
    ContentBlock, LlmErrorKind, LlmMessage, LlmRequest, LlmService, TokenSink,
};
use crate::turn::{transition, Effect, SessionContext, ToolCall, TurnEvent, TurnState};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

const SYSTEM_PROMPT: &str = "You are a helpful chat assistant. Use the web_search tool for \
current events and facts you are unsure about, and the stock_price tool for stock quotes. \
Answer directly when no tool is needed.";

const MAX_COMPLETION_TOKENS: u32 = 4096;

/// Generic conversation runtime over any storage, model, and tool implementations
pub struct SessionRuntime<S, L, T>
where
    S: Storage + Clone + 'static,
    L: LlmService + 'static,
    T: ToolExecutor + 'static,
{
    context: SessionContext,
    state: TurnState,
    storage: S,
    llm: Arc<L>,
    tools: Arc<T>,
    event_rx: mpsc::Receiver<TurnEvent>,
    event_tx: mpsc::Sender<TurnEvent>,
    broadcast_tx: broadcast::Sender<SseEvent>,
}

impl<S, L, T> SessionRuntime<S, L, T>
where
    S: Storage + Clone + 'static,
    L: LlmService + 'static,
    T: ToolExecutor + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: SessionContext,
        state: TurnState,
        storage: S,
        llm: L,
        tools: T,
        event_rx: mpsc::Receiver<TurnEvent>,
        event_tx: mpsc::Sender<TurnEvent>,
        broadcast_tx: broadcast::Sender<SseEvent>,
    ) -> Self {
        Self {
            context,
            state,
            storage,
            llm: Arc::new(llm),
            tools: Arc::new(tools),
            event_rx,
            event_tx,
            broadcast_tx,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.context.conversation_id, "Starting session runtime");

        while let Some(event) = self.event_rx.recv().await {
            if let Err(e) = self.process_event(event).await {
                tracing::error!(
                    conv_id = %self.context.conversation_id,
                    error = %e,
                    "Error handling event"
                );
                let _ = self.broadcast_tx.send(SseEvent::Error { message: e });
            }
        }

        tracing::info!(conv_id = %self.context.conversation_id, "Session runtime stopped");
    }

    async fn process_event(&mut self, event: TurnEvent) -> Result<(), String> {
        // Transition errors are user-facing (e.g. "turn in progress") and
        // reach subscribers through the run loop's error broadcast
        let result = transition(&self.state, &self.context, event).map_err(|e| e.to_string())?;

        self.state = result.new_state;

        for effect in result.effects {
            self.execute_effect(effect).await?;
        }

        Ok(())
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<(), String> {
        match effect {
            Effect::PersistMessage { content, usage } => {
                self.persist_and_broadcast(&content, usage.as_ref()).await
            }

            Effect::PersistToolResults { results } => {
                for result in results {
                    let content =
                        MessageContent::tool(&result.tool_use_id, &result.output, result.is_error);
                    self.persist_and_broadcast(&content, None).await?;
                }
                Ok(())
            }

            Effect::PersistState => {
                self.storage
                    .update_state(&self.context.conversation_id, &self.state)
                    .await?;

                let state_json = serde_json::to_value(&self.state).unwrap_or(Value::Null);
                let _ = self
                    .broadcast_tx
                    .send(SseEvent::StateChange { state: state_json });
                Ok(())
            }

            Effect::RequestModel => {
                self.request_model();
                Ok(())
            }

            Effect::DispatchTools { calls } => {
                for call in calls {
                    self.dispatch_tool(call);
                }
                Ok(())
            }

            Effect::NotifyClient { event_type, data } => {
                let event = match event_type.as_str() {
                    "turn_done" => Some(SseEvent::TurnDone),
                    "tool_status" => Some(SseEvent::ToolStatus {
                        name: data["name"].as_str().unwrap_or_default().to_string(),
                        status: data["status"].as_str().unwrap_or_default().to_string(),
                    }),
                    "error" => Some(SseEvent::Error {
                        message: data["message"].as_str().unwrap_or_default().to_string(),
                    }),
                    _ => None,
                };
                if let Some(event) = event {
                    let _ = self.broadcast_tx.send(event);
                }
                Ok(())
            }
        }
    }

    async fn persist_and_broadcast(
        &self,
        content: &MessageContent,
        usage: Option<&crate::llm::Usage>,
    ) -> Result<(), String> {
        let message_id = uuid::Uuid::new_v4().to_string();
        let msg = self
            .storage
            .add_message(&message_id, &self.context.conversation_id, content, usage)
            .await?;

        let msg_json = serde_json::to_value(&msg).unwrap_or(Value::Null);
        let _ = self
            .broadcast_tx
            .send(SseEvent::Message { message: msg_json });
        Ok(())
    }

    /// Make a model request as a background task. The resulting event
    /// arrives back through the event channel; answer-token deltas are
    /// broadcast while the request streams.
    fn request_model(&self) {
        let llm = self.llm.clone();
        let tools = self.tools.clone();
        let storage = self.storage.clone();
        let event_tx = self.event_tx.clone();
        let broadcast_tx = self.broadcast_tx.clone();
        let conv_id = self.context.conversation_id.clone();
        let timeout = self.context.model_timeout;

        tokio::spawn(async move {
            let messages = match build_llm_messages(&storage, &conv_id).await {
                Ok(m) => m,
                Err(e) => {
                    let _ = event_tx
                        .send(TurnEvent::ModelFailed {
                            message: e,
                            kind: ErrorKind::Unknown,
                        })
                        .await;
                    return;
                }
            };

            let request = LlmRequest {
                system: Some(SYSTEM_PROMPT.to_string()),
                messages,
                tools: tools.definitions(),
                max_tokens: Some(MAX_COMPLETION_TOKENS),
            };

            // Forward streamed deltas to subscribers as they arrive
            let (delta_tx, mut delta_rx) = mpsc::unbounded_channel();
            let sink = TokenSink::new(delta_tx);
            let forwarder = tokio::spawn(async move {
                while let Some(delta) = delta_rx.recv().await {
                    let _ = broadcast_tx.send(SseEvent::Token { text: delta });
                }
            });

            let outcome = tokio::time::timeout(timeout, llm.complete(&request, &sink)).await;
            drop(sink);
            let _ = forwarder.await;

            let event = match outcome {
                Ok(Ok(response)) => {
                    let tool_calls: Vec<ToolCall> = response
                        .tool_uses()
                        .into_iter()
                        .map(|(id, name, input)| ToolCall::new(id, name, input.clone()))
                        .collect();

                    TurnEvent::ModelResponse {
                        content: response.content,
                        tool_calls,
                        usage: response.usage,
                    }
                }
                Ok(Err(e)) => TurnEvent::ModelFailed {
                    message: e.message.clone(),
                    kind: llm_error_kind(e.kind),
                },
                Err(_) => TurnEvent::ModelFailed {
                    message: format!("Model request timed out after {}s", timeout.as_secs()),
                    kind: ErrorKind::Network,
                },
            };
            let _ = event_tx.send(event).await;
        });
    }

    /// Dispatch one tool call as a background task. Calls from the same
    /// batch run concurrently; each sends its own completion event.
    fn dispatch_tool(&self, call: ToolCall) {
        let tools = self.tools.clone();
        let event_tx = self.event_tx.clone();
        let timeout = self.context.tool_timeout;

        tokio::spawn(async move {
            tracing::info!(tool = %call.name, id = %call.id, "Executing tool");

            let outcome =
                tokio::time::timeout(timeout, tools.execute(&call.name, call.input.clone())).await;

            let result = match outcome {
                Ok(Some(output)) => {
                    if output.success {
                        ToolResult::success(&call.id, output.output)
                    } else {
                        ToolResult::error(&call.id, output.output)
                    }
                }
                Ok(None) => ToolResult::unknown_tool(&call.id, &call.name),
                Err(_) => ToolResult::error(
                    &call.id,
                    format!("Tool timed out after {}s", timeout.as_secs()),
                ),
            };

            let _ = event_tx
                .send(TurnEvent::ToolFinished {
                    tool_use_id: call.id,
                    result,
                })
                .await;
        });
    }
}

/// Build the model request messages from persisted history
async fn build_llm_messages<S: Storage>(
    storage: &S,
    conv_id: &str,
) -> Result<Vec<LlmMessage>, String> {
    let db_messages = storage.get_messages(conv_id).await?;

    let mut messages = Vec::new();
    for msg in db_messages {
        match &msg.content {
            MessageContent::User(UserContent { text }) => {
                messages.push(LlmMessage::user(vec![ContentBlock::text(text)]));
            }
            MessageContent::Assistant(blocks) => {
                messages.push(LlmMessage::assistant(blocks.clone()));
            }
            MessageContent::Tool(ToolContent {
                tool_use_id,
                content,
                is_error,
            }) => {
                // Tool results travel back to the model on the user side
                messages.push(LlmMessage::user(vec![ContentBlock::tool_result(
                    tool_use_id,
                    content,
                    *is_error,
                )]));
            }
            // Error rows are for the UI, not the model
            MessageContent::Error(_) => {}
        }
    }

    Ok(messages)
}

fn llm_error_kind(kind: LlmErrorKind) -> ErrorKind {
    match kind {
        LlmErrorKind::Auth => ErrorKind::Auth,
        LlmErrorKind::RateLimit => ErrorKind::RateLimit,
        LlmErrorKind::Network => ErrorKind::Network,
        LlmErrorKind::InvalidRequest => ErrorKind::InvalidRequest,
        LlmErrorKind::ServerError => ErrorKind::ServerError,
        LlmErrorKind::Unknown => ErrorKind::Unknown,
    }
}
