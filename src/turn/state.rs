//! Turn state types

use crate::db::{ErrorKind, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// A tool invocation requested by the model.
///
/// The name is resolved against the registry at dispatch time; an unknown
/// name becomes an error result, never a crash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Turn state, persisted as tagged JSON on the conversation row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnState {
    /// No turn in flight; ready for the next user message. A finished turn
    /// lands back here.
    #[default]
    Idle,

    /// Model request in flight. `round` counts completed tool cycles
    /// within the current turn.
    AwaitingModel { round: u32 },

    /// Tool calls dispatched; waiting for every result before going back
    /// to the model.
    AwaitingTools {
        pending: Vec<ToolCall>,
        #[serde(default)]
        collected: Vec<ToolResult>,
        round: u32,
    },

    /// Turn failed (model error or tool-cycle limit). The next user
    /// message starts a fresh turn.
    Failed { message: String, kind: ErrorKind },
}

impl TurnState {
    /// Check if a turn is currently in flight
    pub fn turn_active(&self) -> bool {
        matches!(
            self,
            TurnState::AwaitingModel { .. } | TurnState::AwaitingTools { .. }
        )
    }
}

/// Default cap on tool cycles per turn
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 10;

/// Per-conversation configuration, constructed once and passed to the
/// executor. No global state anywhere.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub conversation_id: String,
    /// Maximum tool cycles in one turn before the turn fails
    pub max_tool_rounds: u32,
    /// Upper bound on a single model request
    pub model_timeout: Duration,
    /// Upper bound on a single tool invocation
    pub tool_timeout: Duration,
}

impl SessionContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            model_timeout: Duration::from_secs(120),
            tool_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_tool_rounds(mut self, max_tool_rounds: u32) -> Self {
        self.max_tool_rounds = max_tool_rounds;
        self
    }
}
