//! Session store
//!
//! Persists per-conversation message sequences and turn state in SQLite.
//! Conversations are created on first use and never deleted here; message
//! sequences are append-only.

mod schema;

pub use schema::*;

use crate::llm::Usage;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle.
///
/// All access goes through one connection behind a mutex, so appends for a
/// given conversation are serialized in submission order.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation explicitly (API surface)
    pub fn create_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        ensure_conversation(&conn, id, &now)?;

        Ok(Conversation {
            id: id.to_string(),
            state: TurnState::Idle,
            state_updated_at: now,
            created_at: now,
            updated_at: now,
            message_count: 0,
        })
    }

    /// Get conversation by ID
    pub fn get_conversation(&self, id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.state, c.state_updated_at, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) as message_count
             FROM conversations c WHERE c.id = ?1",
        )?;

        stmt.query_row(params![id], parse_conversation_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::ConversationNotFound(id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List all conversations, most recently active first
    pub fn list_conversations(&self) -> DbResult<Vec<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT c.id, c.state, c.state_updated_at, c.created_at, c.updated_at,
                    (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) as message_count
             FROM conversations c
             ORDER BY c.updated_at DESC",
        )?;

        let rows = stmt.query_map([], parse_conversation_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Enumerate every conversation identifier with at least one recorded
    /// message. No order guarantee.
    pub fn list_conversation_ids(&self) -> DbResult<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT conversation_id FROM messages")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Update persisted turn state
    pub fn update_state(&self, id: &str, state: &TurnState) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let state_json = serde_json::to_string(state).unwrap_or_else(|_| "{}".to_string());

        let updated = conn.execute(
            "UPDATE conversations SET state = ?1, state_updated_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![state_json, now.to_rfc3339(), id],
        )?;

        if updated == 0 {
            return Err(DbError::ConversationNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Reset every conversation to idle on server start.
    ///
    /// Also repairs interrupted turns: any assistant message whose tool_use
    /// blocks never got a tool result gets a synthetic error result
    /// injected, so the history stays consumable by the model.
    pub fn reset_all_to_idle(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let idle_state = serde_json::to_string(&TurnState::Idle).unwrap_or_default();

        repair_orphaned_tool_use(&conn, &now)?;

        conn.execute(
            "UPDATE conversations SET state = ?1, state_updated_at = ?2, updated_at = ?2
             WHERE json_extract(state, '$.type') != 'idle'",
            params![idle_state, now.to_rfc3339()],
        )?;
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message to a conversation.
    ///
    /// Creates the conversation row on first use. The sequence id is
    /// assigned under the connection lock, so appends never reorder.
    pub fn add_message(
        &self,
        message_id: &str,
        conversation_id: &str,
        content: &MessageContent,
        usage: Option<&Usage>,
    ) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let msg_type = content.message_type();

        ensure_conversation(&conn, conversation_id, &now)?;

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        let content_str = serde_json::to_string(&content.to_json())
            .unwrap_or_else(|_| "null".to_string());
        let usage_str = usage.map(|u| serde_json::to_string(u).unwrap_or_default());

        conn.execute(
            "INSERT INTO messages (message_id, conversation_id, sequence_id, message_type, content, usage_data, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message_id,
                conversation_id,
                sequence_id,
                msg_type.to_string(),
                content_str,
                usage_str,
                now.to_rfc3339(),
            ],
        )?;

        conn.execute(
            "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;

        Ok(Message {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            sequence_id,
            message_type: msg_type,
            content: content.clone(),
            usage: usage.cloned(),
            created_at: now,
        })
    }

    /// Get all messages for a conversation, in append order.
    /// An unknown conversation yields an empty sequence, not an error.
    pub fn get_messages(&self, conversation_id: &str) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, sequence_id, message_type, content, usage_data, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get messages after a sequence ID (incremental catch-up)
    pub fn get_messages_after(
        &self,
        conversation_id: &str,
        after_sequence: i64,
    ) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT message_id, conversation_id, sequence_id, message_type, content, usage_data, created_at
             FROM messages WHERE conversation_id = ?1 AND sequence_id > ?2 ORDER BY sequence_id ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id, after_sequence], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Get the last sequence ID for a conversation
    pub fn get_last_sequence_id(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }
}

/// Insert the conversation row if this id has never been seen
fn ensure_conversation(conn: &Connection, id: &str, now: &DateTime<Utc>) -> DbResult<()> {
    conn.execute(
        "INSERT OR IGNORE INTO conversations (id, state, state_updated_at, created_at, updated_at)
         VALUES (?1, '{\"type\":\"idle\"}', ?2, ?2, ?2)",
        params![id, now.to_rfc3339()],
    )?;
    Ok(())
}

/// Scan all conversations for unanswered tool_use blocks and inject
/// synthetic error results for them.
fn repair_orphaned_tool_use(conn: &Connection, now: &DateTime<Utc>) -> DbResult<()> {
    use crate::llm::ContentBlock;

    let mut conv_stmt = conn.prepare("SELECT id FROM conversations")?;
    let conv_ids: Vec<String> = conv_stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();

    for conv_id in conv_ids {
        let mut msg_stmt = conn.prepare(
            "SELECT sequence_id, message_type, content
             FROM messages WHERE conversation_id = ?1 ORDER BY sequence_id ASC",
        )?;

        let messages: Vec<(i64, String, String)> = msg_stmt
            .query_map(params![conv_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(Result::ok)
            .collect();

        let mut pending_tool_ids: Vec<String> = Vec::new();
        let mut max_sequence_id: i64 = 0;

        for (seq_id, msg_type, content) in &messages {
            max_sequence_id = *seq_id;

            if msg_type == "assistant" {
                if let Ok(blocks) = serde_json::from_str::<Vec<ContentBlock>>(content) {
                    for block in blocks {
                        if let ContentBlock::ToolUse { id, .. } = block {
                            pending_tool_ids.push(id);
                        }
                    }
                }
            } else if msg_type == "tool" {
                if let Ok(tool_content) = serde_json::from_str::<ToolContent>(content) {
                    pending_tool_ids.retain(|id| id != &tool_content.tool_use_id);
                }
            }
        }

        for tool_id in pending_tool_ids {
            max_sequence_id += 1;
            let msg_id = uuid::Uuid::new_v4().to_string();
            let content = MessageContent::tool(
                &tool_id,
                "[Tool execution interrupted by server restart]",
                true,
            );
            let content_json = serde_json::to_string(&content.to_json())
                .unwrap_or_else(|_| "null".to_string());

            conn.execute(
                "INSERT INTO messages (message_id, conversation_id, sequence_id, message_type, content, created_at)
                 VALUES (?1, ?2, ?3, 'tool', ?4, ?5)",
                params![msg_id, conv_id, max_sequence_id, content_json, now.to_rfc3339()],
            )?;

            tracing::info!(
                conv_id = %conv_id,
                tool_id = %tool_id,
                "Injected synthetic tool result for interrupted tool call"
            );
        }
    }

    Ok(())
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let state_json: String = row.get(1)?;
    let state: TurnState = serde_json::from_str(&state_json).unwrap_or_default();
    Ok(Conversation {
        id: row.get(0)?,
        state,
        state_updated_at: parse_datetime(&row.get::<_, String>(2)?),
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        updated_at: parse_datetime(&row.get::<_, String>(4)?),
        message_count: row.get(5)?,
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let msg_type = parse_message_type(&row.get::<_, String>(3)?);
    let content_str: String = row.get(4)?;
    let content_value: serde_json::Value = serde_json::from_str(&content_str).unwrap_or_default();

    let content = MessageContent::from_json(msg_type, content_value)
        .unwrap_or_else(|_| MessageContent::error(format!("Failed to parse {msg_type} message")));

    Ok(Message {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        sequence_id: row.get(2)?,
        message_type: msg_type,
        content,
        usage: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: parse_datetime(&row.get::<_, String>(6)?),
    })
}

fn parse_message_type(s: &str) -> MessageType {
    match s {
        "user" => MessageType::User,
        "assistant" => MessageType::Assistant,
        "tool" => MessageType::Tool,
        _ => MessageType::Error,
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
