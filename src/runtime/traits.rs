//! Trait seams for runtime I/O
//!
//! The executor only sees these traits, so tests can swap in mock
//! collaborators without real I/O.

use crate::db::{Message, MessageContent};
use crate::llm::Usage;
use crate::tools::ToolOutput;
use crate::turn::TurnState;
use async_trait::async_trait;
use serde_json::Value;

/// Storage for conversation messages
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a message to the conversation
    async fn add_message(
        &self,
        message_id: &str,
        conv_id: &str,
        content: &MessageContent,
        usage: Option<&Usage>,
    ) -> Result<Message, String>;

    /// Get all messages for a conversation, in append order
    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String>;
}

/// Storage for persisted turn state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn update_state(&self, conv_id: &str, state: &TurnState) -> Result<(), String>;

    #[allow(dead_code)] // API completeness
    async fn get_state(&self, conv_id: &str) -> Result<TurnState, String>;
}

/// Executor for tools
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Execute a tool by name; `None` means the name is not registered
    async fn execute(&self, name: &str, input: Value) -> Option<ToolOutput>;

    /// Get tool definitions for the model
    fn definitions(&self) -> Vec<crate::llm::ToolDefinition>;
}

/// Combined storage trait for convenience
pub trait Storage: MessageStore + StateStore {}
impl<T: MessageStore + StateStore> Storage for T {}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

use std::sync::Arc;

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn add_message(
        &self,
        message_id: &str,
        conv_id: &str,
        content: &MessageContent,
        usage: Option<&Usage>,
    ) -> Result<Message, String> {
        (**self).add_message(message_id, conv_id, content, usage).await
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        (**self).get_messages(conv_id).await
    }
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn update_state(&self, conv_id: &str, state: &TurnState) -> Result<(), String> {
        (**self).update_state(conv_id, state).await
    }

    async fn get_state(&self, conv_id: &str) -> Result<TurnState, String> {
        (**self).get_state(conv_id).await
    }
}

#[async_trait]
impl<T: ToolExecutor + ?Sized> ToolExecutor for Arc<T> {
    async fn execute(&self, name: &str, input: Value) -> Option<ToolOutput> {
        (**self).execute(name, input).await
    }

    fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        (**self).definitions()
    }
}

// ============================================================================
// Production adapters
// ============================================================================

use crate::db::Database;
use crate::tools::ToolRegistry;

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn add_message(
        &self,
        message_id: &str,
        conv_id: &str,
        content: &MessageContent,
        usage: Option<&Usage>,
    ) -> Result<Message, String> {
        self.db
            .add_message(message_id, conv_id, content, usage)
            .map_err(|e| e.to_string())
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        self.db.get_messages(conv_id).map_err(|e| e.to_string())
    }
}

#[async_trait]
impl StateStore for DatabaseStorage {
    async fn update_state(&self, conv_id: &str, state: &TurnState) -> Result<(), String> {
        self.db.update_state(conv_id, state).map_err(|e| e.to_string())
    }

    async fn get_state(&self, conv_id: &str) -> Result<TurnState, String> {
        let conv = self.db.get_conversation(conv_id).map_err(|e| e.to_string())?;
        Ok(conv.state)
    }
}

/// Adapter to use ToolRegistry as ToolExecutor
pub struct RegistryToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl RegistryToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ToolExecutor for RegistryToolExecutor {
    async fn execute(&self, name: &str, input: Value) -> Option<ToolOutput> {
        self.registry.execute(name, input).await
    }

    fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.registry.definitions()
    }
}
