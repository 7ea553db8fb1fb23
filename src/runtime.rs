//! Runtime for executing conversations
//!
//! Maps conversation ids to running executor tasks and fans events out to
//! SSE subscribers. Different conversations run independently; events for
//! one conversation are serialized through its channel.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::SessionRuntime;
pub use traits::*;

use crate::db::Database;
use crate::llm::LlmService;
use crate::tools::ToolRegistry;
use crate::turn::{SessionContext, TurnEvent, TurnState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Type alias for the production runtime with concrete implementations
pub type ProductionRuntime =
    SessionRuntime<DatabaseStorage, Arc<dyn LlmService>, RegistryToolExecutor>;

/// Manager for all conversation runtimes
pub struct SessionManager {
    db: Database,
    llm: Arc<dyn LlmService>,
    tools: Arc<ToolRegistry>,
    max_tool_rounds: u32,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

/// Handle to interact with a running conversation
pub struct SessionHandle {
    pub event_tx: mpsc::Sender<TurnEvent>,
    pub broadcast_tx: broadcast::Sender<SseEvent>,
}

/// Events sent to SSE clients
#[derive(Debug, Clone)]
pub enum SseEvent {
    Init {
        conversation: serde_json::Value,
        messages: Vec<serde_json::Value>,
        turn_active: bool,
        last_sequence_id: i64,
    },
    /// A message was appended to the conversation
    Message { message: serde_json::Value },
    /// Provisional answer text, streamed while the model responds
    Token { text: String },
    /// A tool started or finished
    ToolStatus { name: String, status: String },
    /// Persisted turn state changed
    StateChange { state: serde_json::Value },
    /// The turn reached its final answer
    TurnDone,
    Error { message: String },
}

impl SessionManager {
    pub fn new(
        db: Database,
        llm: Arc<dyn LlmService>,
        tools: Arc<ToolRegistry>,
        max_tool_rounds: u32,
    ) -> Self {
        Self {
            db,
            llm,
            tools,
            max_tool_rounds,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create a runtime for a conversation. Conversations come into
    /// existence on first use of an identifier.
    pub async fn get_or_create(&self, conversation_id: &str) -> Result<SessionHandle, String> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(conversation_id) {
                return Ok(SessionHandle {
                    event_tx: handle.event_tx.clone(),
                    broadcast_tx: handle.broadcast_tx.clone(),
                });
            }
        }

        // Make sure the conversation row exists before any state write
        self.db
            .create_conversation(conversation_id)
            .map_err(|e| e.to_string())?;

        let context = SessionContext::new(conversation_id)
            .with_max_tool_rounds(self.max_tool_rounds);

        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);

        let storage = DatabaseStorage::new(self.db.clone());
        let tool_executor = RegistryToolExecutor::new(self.tools.clone());

        let runtime: ProductionRuntime = SessionRuntime::new(
            context,
            TurnState::Idle, // conversations always resume idle after restart
            storage,
            self.llm.clone(),
            tool_executor,
            event_rx,
            event_tx.clone(),
            broadcast_tx.clone(),
        );

        let conv_id = conversation_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "Session runtime finished");
        });

        let handle = SessionHandle {
            event_tx: event_tx.clone(),
            broadcast_tx: broadcast_tx.clone(),
        };

        self.sessions.write().await.insert(
            conversation_id.to_string(),
            SessionHandle {
                event_tx,
                broadcast_tx,
            },
        );

        Ok(handle)
    }

    /// Send an event to a conversation
    pub async fn send_event(&self, conversation_id: &str, event: TurnEvent) -> Result<(), String> {
        let handle = self.get_or_create(conversation_id).await?;
        handle
            .event_tx
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {e}"))
    }

    /// Subscribe to conversation updates
    pub async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<SseEvent>, String> {
        let handle = self.get_or_create(conversation_id).await?;
        Ok(handle.broadcast_tx.subscribe())
    }

    /// Get the database handle
    pub fn db(&self) -> &Database {
        &self.db
    }
}
