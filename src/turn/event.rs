//! Events that drive a conversation's turn loop

use crate::db::{ErrorKind, ToolResult};
use crate::llm::{ContentBlock, Usage};
use crate::turn::state::ToolCall;

/// Events that trigger state transitions
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// User submitted a message
    UserMessage { text: String },

    /// Model responded; `tool_calls` are the typed calls extracted from
    /// the content blocks
    ModelResponse {
        content: Vec<ContentBlock>,
        tool_calls: Vec<ToolCall>,
        usage: Usage,
    },

    /// Model request failed (caught and reported, no retry)
    ModelFailed { message: String, kind: ErrorKind },

    /// One dispatched tool produced its result (success or error)
    ToolFinished {
        tool_use_id: String,
        result: ToolResult,
    },
}
