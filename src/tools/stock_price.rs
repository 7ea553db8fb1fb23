//! Stock price lookup tool backed by the Alpha Vantage GLOBAL_QUOTE endpoint

use super::{Tool, ToolOutput};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://www.alphavantage.co";

/// Latest quote lookup for a ticker symbol
pub struct StockPriceTool {
    client: Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct StockPriceInput {
    symbol: String,
}

impl StockPriceTool {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    async fn fetch_quote(&self, symbol: &str) -> Result<String, String> {
        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("function", "GLOBAL_QUOTE"),
                ("symbol", symbol),
                ("apikey", &self.api_key),
            ])
            .send()
            .await
            .map_err(|e| format!("Quote request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("Quote endpoint returned HTTP {status}"));
        }

        let payload: QuotePayload = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse quote response: {e}"))?;

        render_quote(&payload, symbol)
    }
}

#[async_trait]
impl Tool for StockPriceTool {
    fn name(&self) -> &str {
        "stock_price"
    }

    fn description(&self) -> String {
        "Fetch the latest stock quote for a ticker symbol (e.g. 'AAPL'): price, change, and last trading day.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["symbol"],
            "properties": {
                "symbol": {
                    "type": "string",
                    "description": "The ticker symbol to look up, e.g. 'AAPL'"
                }
            }
        })
    }

    async fn run(&self, input: Value) -> ToolOutput {
        let input: StockPriceInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let symbol = input.symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return ToolOutput::error("Invalid input: symbol must not be empty");
        }

        match self.fetch_quote(&symbol).await {
            Ok(text) => ToolOutput::success(text),
            Err(message) => ToolOutput::error(message),
        }
    }
}

// Alpha Vantage wraps the quote in a "Global Quote" object; errors and rate
// limits arrive as top-level "Error Message" / "Note" strings with HTTP 200

#[derive(Debug, Deserialize)]
struct QuotePayload {
    #[serde(rename = "Global Quote", default)]
    quote: Option<GlobalQuote>,
    #[serde(rename = "Error Message", default)]
    error_message: Option<String>,
    #[serde(rename = "Note", default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlobalQuote {
    #[serde(rename = "01. symbol", default)]
    symbol: String,
    #[serde(rename = "05. price", default)]
    price: String,
    #[serde(rename = "07. latest trading day", default)]
    latest_trading_day: String,
    #[serde(rename = "08. previous close", default)]
    previous_close: String,
    #[serde(rename = "09. change", default)]
    change: String,
    #[serde(rename = "10. change percent", default)]
    change_percent: String,
}

fn render_quote(payload: &QuotePayload, requested: &str) -> Result<String, String> {
    if let Some(message) = &payload.error_message {
        return Err(format!("Quote lookup failed: {message}"));
    }
    if let Some(note) = &payload.note {
        return Err(format!("Quote lookup throttled: {note}"));
    }

    let quote = payload
        .quote
        .as_ref()
        .filter(|q| !q.symbol.is_empty())
        .ok_or_else(|| format!("No quote found for symbol \"{requested}\""))?;

    Ok(format!(
        "{}: {} (change {} / {}, previous close {}, as of {})",
        quote.symbol,
        quote.price,
        quote.change,
        quote.change_percent,
        quote.previous_close,
        quote.latest_trading_day,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_symbol_is_error() {
        let tool = StockPriceTool::new("demo".to_string());
        let result = tool.run(json!({})).await;
        assert!(!result.success);
        assert!(result.output.contains("Invalid input"));
    }

    #[tokio::test]
    async fn test_blank_symbol_is_error() {
        let tool = StockPriceTool::new("demo".to_string());
        let result = tool.run(json!({"symbol": ""})).await;
        assert!(!result.success);
    }

    #[test]
    fn test_render_quote() {
        let payload: QuotePayload = serde_json::from_str(
            r#"{
                "Global Quote": {
                    "01. symbol": "AAPL",
                    "02. open": "230.00",
                    "03. high": "233.10",
                    "04. low": "229.50",
                    "05. price": "231.40",
                    "06. volume": "51234567",
                    "07. latest trading day": "2025-11-07",
                    "08. previous close": "229.90",
                    "09. change": "1.50",
                    "10. change percent": "0.6525%"
                }
            }"#,
        )
        .unwrap();

        let text = render_quote(&payload, "AAPL").unwrap();
        assert!(text.contains("AAPL: 231.40"));
        assert!(text.contains("0.6525%"));
        assert!(text.contains("2025-11-07"));
    }

    #[test]
    fn test_render_unknown_symbol() {
        // Unknown symbols come back as an empty quote object
        let payload: QuotePayload =
            serde_json::from_str(r#"{"Global Quote": {}}"#).unwrap();
        let err = render_quote(&payload, "ZZZZZZ").unwrap_err();
        assert!(err.contains("No quote found"));
    }

    #[test]
    fn test_render_upstream_error() {
        let payload: QuotePayload =
            serde_json::from_str(r#"{"Error Message": "Invalid API call"}"#).unwrap();
        let err = render_quote(&payload, "AAPL").unwrap_err();
        assert!(err.contains("Invalid API call"));
    }

    #[test]
    fn test_render_rate_limit_note() {
        let payload: QuotePayload = serde_json::from_str(
            r#"{"Note": "Thank you for using Alpha Vantage! Our standard API rate limit is 25 requests per day."}"#,
        )
        .unwrap();
        let err = render_quote(&payload, "AAPL").unwrap_err();
        assert!(err.contains("throttled"));
    }

    #[test]
    fn test_symbol_is_uppercased() {
        let input: StockPriceInput = serde_json::from_value(json!({"symbol": "aapl"})).unwrap();
        assert_eq!(input.symbol.trim().to_uppercase(), "AAPL");
    }
}
