//! Effects produced by state transitions
//!
//! The transition function stays pure; the runtime interprets these.

use crate::db::{MessageContent, ToolResult};
use crate::llm::Usage;
use crate::turn::state::ToolCall;
use serde_json::Value;

/// Effects to be executed after a state transition
#[derive(Debug, Clone)]
pub enum Effect {
    /// Append a message to the conversation
    PersistMessage {
        content: MessageContent,
        usage: Option<Usage>,
    },

    /// Append several tool results at once
    PersistToolResults { results: Vec<ToolResult> },

    /// Persist the new turn state
    PersistState,

    /// Make a model request with the full history
    RequestModel,

    /// Dispatch all requested tool calls (concurrently)
    DispatchTools { calls: Vec<ToolCall> },

    /// Notify connected clients
    NotifyClient { event_type: String, data: Value },
}

impl Effect {
    pub fn persist_user_message(text: impl Into<String>) -> Self {
        Effect::PersistMessage {
            content: MessageContent::user(text),
            usage: None,
        }
    }

    pub fn persist_assistant_message(
        content: Vec<crate::llm::ContentBlock>,
        usage: Usage,
    ) -> Self {
        Effect::PersistMessage {
            content: MessageContent::assistant(content),
            usage: Some(usage),
        }
    }

    pub fn persist_tool_message(result: &ToolResult) -> Self {
        Effect::PersistMessage {
            content: MessageContent::tool(&result.tool_use_id, &result.output, result.is_error),
            usage: None,
        }
    }

    pub fn notify_turn_done() -> Self {
        Effect::NotifyClient {
            event_type: "turn_done".to_string(),
            data: Value::Null,
        }
    }

    pub fn notify_tool_status(name: &str, status: &str) -> Self {
        Effect::NotifyClient {
            event_type: "tool_status".to_string(),
            data: serde_json::json!({
                "name": name,
                "status": status,
            }),
        }
    }

    pub fn notify_error(message: &str) -> Self {
        Effect::NotifyClient {
            event_type: "error".to_string(),
            data: serde_json::json!({ "message": message }),
        }
    }
}
