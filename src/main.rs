//! Skiff - a thin chat assistant server
//!
//! A browser-facing chat backend: a conversation turn engine over a hosted
//! model, two lookup tools, and SQLite-persisted history.

mod api;
mod db;
mod llm;
mod runtime;
mod tools;
mod turn;

use api::{create_router, AppState};
use db::Database;
use llm::{LlmService, LoggingService, OpenAiService};
use runtime::SessionManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tools::ToolRegistry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Environment first: .env is optional, real env wins
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skiff=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    // Configuration
    let db_path = std::env::var("SKIFF_DB_PATH").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        format!("{home}/.skiff/chat.db")
    });

    let port: u16 = std::env::var("SKIFF_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    let model = std::env::var("SKIFF_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

    let max_tool_rounds: u32 = std::env::var("SKIFF_MAX_TOOL_ROUNDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(turn::DEFAULT_MAX_TOOL_ROUNDS);

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %db_path, "Opening database");
    let db = Database::open(&db_path)?;

    // Interrupted turns from a previous run reset to idle, with their
    // unanswered tool calls repaired
    db.reset_all_to_idle()?;
    tracing::info!(
        conversations = db.list_conversation_ids()?.len(),
        "Conversation history loaded"
    );

    // Model collaborator
    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY is not set; model requests will fail until it is");
    }
    let base_url = std::env::var("OPENAI_BASE_URL").ok();
    let openai = OpenAiService::new(api_key, model, base_url.as_deref());
    let llm: Arc<dyn LlmService> =
        Arc::new(LoggingService::new(Arc::new(openai) as Arc<dyn LlmService>));
    tracing::info!(model = %llm.model_id(), "Model client initialized");

    // Tool registry
    let alpha_vantage_key =
        std::env::var("ALPHAVANTAGE_API_KEY").unwrap_or_else(|_| "demo".to_string());
    let tools = Arc::new(ToolRegistry::new(alpha_vantage_key));

    // Application state
    let sessions = SessionManager::new(db, llm, tools, max_tool_rounds);
    let state = AppState::new(sessions);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Skiff server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
