//! Tool implementations
//!
//! Two network-backed tools the model can call: web search and stock-price
//! lookup. Every failure inside a tool is converted into a structured error
//! output; nothing here crashes a turn.

mod stock_price;
mod web_search;

pub use stock_price::StockPriceTool;
pub use web_search::WebSearchTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }
}

/// Trait for tools the model can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, as advertised to the model
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool. Must not panic; failures become error outputs.
    async fn run(&self, input: Value) -> ToolOutput;
}

/// The fixed set of tools available to every conversation
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new(alpha_vantage_api_key: String) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(WebSearchTool::new()),
            Arc::new(StockPriceTool::new(alpha_vantage_api_key)),
        ];
        Self { tools }
    }

    /// Get all tool definitions for the model
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name. `None` means no such tool is registered.
    pub async fn execute(&self, name: &str, input: Value) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input).await);
            }
        }
        None
    }
}
