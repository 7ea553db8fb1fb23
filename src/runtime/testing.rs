//! Mock implementations for testing
//!
//! These mocks enable integration testing of the turn loop without real
//! I/O: a scripted model, a canned tool executor, and in-memory storage.

use super::traits::*;
use crate::db::{Message, MessageContent};
use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService, TokenSink, ToolDefinition, Usage};
use crate::tools::ToolOutput;
use crate::turn::TurnState;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Mock model service
// ============================================================================

/// Scripted model that returns queued responses in order
pub struct MockLlmService {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl MockLlmService {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response
    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    /// Queue an error response
    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmService for MockLlmService {
    async fn complete(
        &self,
        request: &LlmRequest,
        sink: &TokenSink,
    ) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No mock response queued")));

        // Mimic streaming: text content goes through the sink first
        if let Ok(response) = &next {
            for block in &response.content {
                if let crate::llm::ContentBlock::Text { text } = block {
                    sink.push(text);
                }
            }
        }

        next
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Mock tool executor
// ============================================================================

/// Tool executor with predefined outputs per tool name
pub struct MockToolExecutor {
    outputs: HashMap<String, ToolOutput>,
    definitions: Vec<ToolDefinition>,
    /// Record of tool executions
    pub executions: Mutex<Vec<(String, Value)>>,
}

impl MockToolExecutor {
    pub fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            definitions: Vec::new(),
            executions: Mutex::new(Vec::new()),
        }
    }

    /// Add a tool with a predefined output
    pub fn with_tool(mut self, name: impl Into<String>, output: ToolOutput) -> Self {
        let name = name.into();
        self.definitions.push(ToolDefinition {
            name: name.clone(),
            description: format!("Mock {name}"),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        });
        self.outputs.insert(name, output);
        self
    }
}

impl Default for MockToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolExecutor for MockToolExecutor {
    async fn execute(&self, name: &str, input: Value) -> Option<ToolOutput> {
        self.executions
            .lock()
            .unwrap()
            .push((name.to_string(), input));
        self.outputs.get(name).cloned()
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }
}

// ============================================================================
// In-memory storage
// ============================================================================

/// In-memory storage for testing
pub struct InMemoryStorage {
    messages: Mutex<HashMap<String, Vec<Message>>>,
    states: Mutex<HashMap<String, TurnState>>,
    /// When set, every write fails (simulated persistence failure)
    pub fail_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Get all messages for a conversation
    pub fn get_all_messages(&self, conv_id: &str) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap()
            .get(conv_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Get current state for a conversation
    pub fn get_current_state(&self, conv_id: &str) -> Option<TurnState> {
        self.states.lock().unwrap().get(conv_id).cloned()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStorage {
    async fn add_message(
        &self,
        message_id: &str,
        conv_id: &str,
        content: &MessageContent,
        usage: Option<&Usage>,
    ) -> Result<Message, String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("Write failed (simulated)".to_string());
        }

        let mut messages = self.messages.lock().unwrap();
        let entry = messages.entry(conv_id.to_string()).or_default();
        let sequence_id = entry.len() as i64 + 1;

        let msg = Message {
            message_id: message_id.to_string(),
            conversation_id: conv_id.to_string(),
            sequence_id,
            message_type: content.message_type(),
            content: content.clone(),
            usage: usage.cloned(),
            created_at: chrono::Utc::now(),
        };
        entry.push(msg.clone());

        Ok(msg)
    }

    async fn get_messages(&self, conv_id: &str) -> Result<Vec<Message>, String> {
        Ok(self.get_all_messages(conv_id))
    }
}

#[async_trait]
impl StateStore for InMemoryStorage {
    async fn update_state(&self, conv_id: &str, state: &TurnState) -> Result<(), String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err("Write failed (simulated)".to_string());
        }
        self.states
            .lock()
            .unwrap()
            .insert(conv_id.to_string(), state.clone());
        Ok(())
    }

    async fn get_state(&self, conv_id: &str) -> Result<TurnState, String> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(conv_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Test session builder
// ============================================================================

use crate::runtime::{SessionRuntime, SseEvent};
use crate::turn::{SessionContext, TurnEvent};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const TEST_CONV: &str = "test-conv";

/// A running session over mocks, with hooks to observe everything
pub struct TestSession {
    pub storage: Arc<InMemoryStorage>,
    pub event_tx: mpsc::Sender<TurnEvent>,
    pub broadcast_rx: broadcast::Receiver<SseEvent>,
    pub llm: Arc<MockLlmService>,
    pub tools: Arc<MockToolExecutor>,
}

pub struct TestSessionBuilder {
    llm: Option<MockLlmService>,
    tools: Option<MockToolExecutor>,
    storage: Option<InMemoryStorage>,
    max_tool_rounds: u32,
}

impl TestSession {
    pub fn builder() -> TestSessionBuilder {
        TestSessionBuilder {
            llm: None,
            tools: None,
            storage: None,
            max_tool_rounds: crate::turn::DEFAULT_MAX_TOOL_ROUNDS,
        }
    }
}

impl TestSessionBuilder {
    pub fn llm(mut self, llm: MockLlmService) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tools(mut self, tools: MockToolExecutor) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn storage(mut self, storage: InMemoryStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn max_tool_rounds(mut self, max: u32) -> Self {
        self.max_tool_rounds = max;
        self
    }

    pub fn build(self) -> TestSession {
        let storage = Arc::new(self.storage.unwrap_or_default());
        let llm = Arc::new(self.llm.unwrap_or_else(|| MockLlmService::new("test-model")));
        let tools = Arc::new(self.tools.unwrap_or_default());

        let context =
            SessionContext::new(TEST_CONV).with_max_tool_rounds(self.max_tool_rounds);
        let (event_tx, event_rx) = mpsc::channel(32);
        let (broadcast_tx, broadcast_rx) = broadcast::channel(128);

        let runtime = SessionRuntime::new(
            context,
            TurnState::Idle,
            storage.clone(),
            llm.clone(),
            tools.clone(),
            event_rx,
            event_tx.clone(),
            broadcast_tx,
        );

        tokio::spawn(async move {
            runtime.run().await;
        });

        TestSession {
            storage,
            event_tx,
            broadcast_rx,
            llm,
            tools,
        }
    }
}

impl TestSession {
    /// Submit a user message
    pub async fn send_message(&self, text: &str) {
        self.event_tx
            .send(TurnEvent::UserMessage {
                text: text.to_string(),
            })
            .await
            .expect("Failed to send message");
    }

    /// Wait for the turn-done notification
    pub async fn wait_for_turn_done(&mut self, timeout: Duration) -> bool {
        self.wait_for(timeout, |event| matches!(event, SseEvent::TurnDone))
            .await
    }

    /// Wait for a persisted state with the given tag
    pub async fn wait_for_state(&mut self, expected_type: &str, timeout: Duration) -> bool {
        self.wait_for(timeout, |event| {
            matches!(event, SseEvent::StateChange { state }
                if state.get("type").and_then(|v| v.as_str()) == Some(expected_type))
        })
        .await
    }

    /// Wait for any error event
    pub async fn wait_for_error(&mut self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(SseEvent::Error { message })) => return Some(message),
                _ => continue,
            }
        }
        None
    }

    async fn wait_for(
        &mut self,
        timeout: Duration,
        predicate: impl Fn(&SseEvent) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), self.broadcast_rx.recv()).await {
                Ok(Ok(event)) if predicate(&event) => return true,
                _ => continue,
            }
        }
        false
    }

    /// All persisted messages for the test conversation
    pub fn messages(&self) -> Vec<Message> {
        self.storage.get_all_messages(TEST_CONV)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MessageType;
    use crate::llm::ContentBlock;
    use serde_json::json;

    fn text_response(text: &str) -> LlmResponse {
        LlmResponse {
            content: vec![ContentBlock::text(text)],
            usage: Usage::default(),
        }
    }

    fn tool_response(calls: &[(&str, &str, Value)]) -> LlmResponse {
        LlmResponse {
            content: calls
                .iter()
                .map(|(id, name, input)| ContentBlock::tool_use(*id, *name, input.clone()))
                .collect(),
            usage: Usage::default(),
        }
    }

    /// A tool-free answer completes the turn after exactly one model call
    #[tokio::test]
    async fn test_tool_free_turn_is_one_model_call() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(text_response("Hello!"));

        let mut session = TestSession::builder().llm(llm).build();
        session.send_message("Hi").await;

        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        assert_eq!(session.llm.recorded_requests().len(), 1);
        let msgs = session.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].message_type, MessageType::User);
        assert_eq!(msgs[1].message_type, MessageType::Assistant);
        assert_eq!(
            session.storage.get_current_state(TEST_CONV),
            Some(TurnState::Idle)
        );
    }

    /// Full tool cycle: user -> assistant(tool_use) -> tool -> assistant
    #[tokio::test]
    async fn test_tool_cycle() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(tool_response(&[(
            "call-1",
            "web_search",
            json!({"query": "ferris"}),
        )]));
        llm.queue_response(text_response("Ferris is the Rust mascot."));

        let tools = MockToolExecutor::new()
            .with_tool("web_search", ToolOutput::success("Ferris: crab mascot"));

        let mut session = TestSession::builder().llm(llm).tools(tools).build();
        session.send_message("Who is Ferris?").await;

        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        let msgs = session.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].message_type, MessageType::User);
        assert_eq!(msgs[1].message_type, MessageType::Assistant);
        assert_eq!(msgs[2].message_type, MessageType::Tool);
        assert_eq!(msgs[3].message_type, MessageType::Assistant);

        // The tool actually ran with the model's arguments
        let executions = session.tools.executions.lock().unwrap().clone();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].0, "web_search");
        assert_eq!(executions[0].1, json!({"query": "ferris"}));
    }

    /// A failing tool feeds its error back into the conversation as data;
    /// the turn still completes
    #[tokio::test]
    async fn test_failed_tool_then_final_answer() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(tool_response(&[(
            "call-1",
            "stock_price",
            json!({"symbol": "AAPL"}),
        )]));
        llm.queue_response(text_response("I could not fetch the quote."));

        let tools = MockToolExecutor::new()
            .with_tool("stock_price", ToolOutput::error("connection refused"));

        let mut session = TestSession::builder().llm(llm).tools(tools).build();
        session.send_message("Price of AAPL?").await;

        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        let msgs = session.messages();
        assert_eq!(msgs.len(), 4);
        match &msgs[2].content {
            MessageContent::Tool(tc) => {
                assert!(tc.is_error);
                assert!(tc.content.contains("connection refused"));
            }
            other => panic!("Expected tool content, got {other:?}"),
        }
        assert_eq!(msgs[3].message_type, MessageType::Assistant);
        assert_eq!(
            session.storage.get_current_state(TEST_CONV),
            Some(TurnState::Idle)
        );
    }

    /// An unregistered tool name becomes an error-tagged tool message, not
    /// a crash
    #[tokio::test]
    async fn test_unknown_tool_reported_without_crash() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(tool_response(&[("call-1", "magic_wand", json!({}))]));
        llm.queue_response(text_response("That tool does not exist."));

        // Registry with no tools at all
        let mut session = TestSession::builder().llm(llm).build();
        session.send_message("Wave the wand").await;

        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        let msgs = session.messages();
        match &msgs[2].content {
            MessageContent::Tool(tc) => {
                assert!(tc.is_error);
                assert!(tc.content.contains("Unknown tool: magic_wand"));
            }
            other => panic!("Expected tool content, got {other:?}"),
        }
    }

    /// Tools requested together run in the same cycle; the model is only
    /// re-invoked once every result is in
    #[tokio::test]
    async fn test_concurrent_tool_batch() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(tool_response(&[
            ("call-1", "web_search", json!({"query": "rust"})),
            ("call-2", "stock_price", json!({"symbol": "AAPL"})),
        ]));
        llm.queue_response(text_response("Here is everything."));

        let tools = MockToolExecutor::new()
            .with_tool("web_search", ToolOutput::success("some results"))
            .with_tool("stock_price", ToolOutput::success("231.40"));

        let mut session = TestSession::builder().llm(llm).tools(tools).build();
        session.send_message("Rust news and AAPL price").await;

        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        // user, assistant, two tool results, final assistant
        let msgs = session.messages();
        assert_eq!(msgs.len(), 5);
        assert_eq!(msgs[2].message_type, MessageType::Tool);
        assert_eq!(msgs[3].message_type, MessageType::Tool);
        assert_eq!(msgs[4].message_type, MessageType::Assistant);

        // The second model request saw both tool results
        let requests = session.llm.recorded_requests();
        assert_eq!(requests.len(), 2);
        let tool_results = requests[1]
            .messages
            .iter()
            .flat_map(|m| &m.content)
            .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
            .count();
        assert_eq!(tool_results, 2);
    }

    /// The tool cycle cap fails the turn instead of looping forever
    #[tokio::test]
    async fn test_tool_cycle_limit_fails_turn() {
        let llm = MockLlmService::new("test-model");
        // The model keeps asking for tools, round after round
        for i in 0..3 {
            llm.queue_response(tool_response(&[(
                &format!("call-{i}"),
                "web_search",
                json!({"query": "again"}),
            )]));
        }

        let tools = MockToolExecutor::new()
            .with_tool("web_search", ToolOutput::success("more"));

        let mut session = TestSession::builder()
            .llm(llm)
            .tools(tools)
            .max_tool_rounds(1)
            .build();
        session.send_message("Loop forever").await;

        assert!(session.wait_for_state("failed", Duration::from_secs(2)).await);

        match session.storage.get_current_state(TEST_CONV) {
            Some(TurnState::Failed { kind, .. }) => {
                assert_eq!(kind, crate::db::ErrorKind::TurnLimit);
            }
            other => panic!("Expected Failed state, got {other:?}"),
        }

        // The rejected calls still got (synthetic) results persisted
        let msgs = session.messages();
        let last = msgs.last().unwrap();
        assert_eq!(last.message_type, MessageType::Tool);
        match &last.content {
            MessageContent::Tool(tc) => assert!(tc.content.contains("limit")),
            other => panic!("Expected tool content, got {other:?}"),
        }
    }

    /// Model errors are caught and reported; the turn fails
    #[tokio::test]
    async fn test_model_error_fails_turn() {
        let llm = MockLlmService::new("test-model");
        llm.queue_error(LlmError::auth("Invalid API key"));

        let mut session = TestSession::builder().llm(llm).build();
        session.send_message("Hi").await;

        assert!(session.wait_for_state("failed", Duration::from_secs(2)).await);

        // Only the user message was persisted
        let msgs = session.messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_type, MessageType::User);
    }

    /// A failed turn recovers on the next user message
    #[tokio::test]
    async fn test_recovery_after_model_error() {
        let llm = MockLlmService::new("test-model");
        llm.queue_error(LlmError::server_error("upstream down"));
        llm.queue_response(text_response("Back online."));

        let mut session = TestSession::builder().llm(llm).build();
        session.send_message("Hi").await;
        assert!(session.wait_for_state("failed", Duration::from_secs(2)).await);

        session.send_message("Try again").await;
        assert!(session.wait_for_turn_done(Duration::from_secs(2)).await);

        let msgs = session.messages();
        assert_eq!(msgs.last().unwrap().message_type, MessageType::Assistant);
    }

    /// Answer tokens stream to subscribers before the final message lands
    #[tokio::test]
    async fn test_tokens_stream_before_final_message() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(text_response("streamed answer"));

        let mut session = TestSession::builder().llm(llm).build();
        session.send_message("Hi").await;

        let mut saw_token = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), session.broadcast_rx.recv())
                .await
            {
                Ok(Ok(SseEvent::Token { text })) => {
                    assert_eq!(text, "streamed answer");
                    saw_token = true;
                }
                Ok(Ok(SseEvent::Message { message })) => {
                    if message["message_type"] == "assistant" {
                        // Deltas must have arrived before the persisted message
                        assert!(saw_token, "Token events should precede the final message");
                        return;
                    }
                }
                _ => continue,
            }
        }
        panic!("Never saw the final assistant message");
    }

    /// Tool status events bracket tool execution
    #[tokio::test]
    async fn test_tool_status_events() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(tool_response(&[(
            "call-1",
            "web_search",
            json!({"query": "x"}),
        )]));
        llm.queue_response(text_response("done"));

        let tools =
            MockToolExecutor::new().with_tool("web_search", ToolOutput::success("hit"));

        let mut session = TestSession::builder().llm(llm).tools(tools).build();
        session.send_message("search").await;

        let mut statuses = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(50), session.broadcast_rx.recv())
                .await
            {
                Ok(Ok(SseEvent::ToolStatus { name, status })) => {
                    statuses.push((name, status));
                }
                Ok(Ok(SseEvent::TurnDone)) => break,
                _ => continue,
            }
        }

        assert_eq!(
            statuses,
            vec![
                ("web_search".to_string(), "running".to_string()),
                ("web_search".to_string(), "complete".to_string()),
            ]
        );
    }

    /// Persistence failures surface as error events, never silently
    #[tokio::test]
    async fn test_persistence_failure_surfaced() {
        let llm = MockLlmService::new("test-model");
        llm.queue_response(text_response("never stored"));

        let storage = InMemoryStorage::new();
        storage.fail_writes.store(true, Ordering::SeqCst);

        let mut session = TestSession::builder().llm(llm).storage(storage).build();
        session.send_message("Hi").await;

        let error = session.wait_for_error(Duration::from_secs(2)).await;
        assert!(error.unwrap().contains("Write failed"));
    }
}
