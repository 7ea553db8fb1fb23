//! Web search tool backed by the DuckDuckGo Instant Answer API

use super::{Tool, ToolOutput};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.duckduckgo.com";
const MAX_RESULTS: usize = 5;

/// Web search via DuckDuckGo instant answers
pub struct WebSearchTool {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct WebSearchInput {
    query: String,
}

impl WebSearchTool {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    async fn search(&self, query: &str) -> Result<String, String> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .query(&[
                ("q", query),
                ("format", "json"),
                ("no_html", "1"),
                ("skip_disambig", "1"),
            ])
            .send()
            .await
            .map_err(|e| format!("Search request failed: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("Search returned HTTP {status}"));
        }

        let answer: InstantAnswer = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse search response: {e}"))?;

        Ok(summarize(&answer, query))
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> String {
        "Search the web for current information. Returns a short summary and related results for the query.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            }
        })
    }

    async fn run(&self, input: Value) -> ToolOutput {
        let input: WebSearchInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if input.query.trim().is_empty() {
            return ToolOutput::error("Invalid input: query must not be empty");
        }

        match self.search(input.query.trim()).await {
            Ok(summary) => ToolOutput::success(summary),
            Err(message) => ToolOutput::error(message),
        }
    }
}

// Instant Answer payload, reduced to the fields we render

#[derive(Debug, Default, Deserialize)]
struct InstantAnswer {
    #[serde(rename = "Heading", default)]
    heading: String,
    #[serde(rename = "Answer", default)]
    answer: String,
    #[serde(rename = "AbstractText", default)]
    abstract_text: String,
    #[serde(rename = "AbstractURL", default)]
    abstract_url: String,
    #[serde(rename = "RelatedTopics", default)]
    related_topics: Vec<RelatedTopic>,
}

/// Related topics mix plain results with named groups of results
#[derive(Debug, Deserialize)]
struct RelatedTopic {
    #[serde(rename = "Text", default)]
    text: Option<String>,
    #[serde(rename = "FirstURL", default)]
    first_url: Option<String>,
    #[serde(rename = "Topics", default)]
    topics: Vec<RelatedTopic>,
}

fn flatten_topics<'a>(topics: &'a [RelatedTopic], out: &mut Vec<&'a RelatedTopic>) {
    for topic in topics {
        if topic.text.is_some() {
            out.push(topic);
        }
        flatten_topics(&topic.topics, out);
    }
}

fn summarize(answer: &InstantAnswer, query: &str) -> String {
    let mut summary = String::new();

    if !answer.answer.is_empty() {
        let _ = writeln!(summary, "{}", answer.answer);
    }

    if !answer.abstract_text.is_empty() {
        if !answer.heading.is_empty() {
            let _ = writeln!(summary, "{}:", answer.heading);
        }
        let _ = writeln!(summary, "{}", answer.abstract_text);
        if !answer.abstract_url.is_empty() {
            let _ = writeln!(summary, "Source: {}", answer.abstract_url);
        }
    }

    let mut flat = Vec::new();
    flatten_topics(&answer.related_topics, &mut flat);
    if !flat.is_empty() {
        let _ = writeln!(summary, "Related results:");
        for topic in flat.iter().take(MAX_RESULTS) {
            let text = topic.text.as_deref().unwrap_or_default();
            match topic.first_url.as_deref() {
                Some(url) => {
                    let _ = writeln!(summary, "- {text} ({url})");
                }
                None => {
                    let _ = writeln!(summary, "- {text}");
                }
            }
        }
    }

    if summary.is_empty() {
        format!("No results found for \"{query}\"")
    } else {
        summary.trim_end().to_string()
    }
}
