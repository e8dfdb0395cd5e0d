//! Web search through the Serper API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::base_tool::{extract_argument, BaseTool, EnvVar, ToolError};

const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Anything that can answer a web search query.
#[async_trait]
pub trait SearchTool: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ToolError>;
}

/// Render search hits as an agent observation.
pub fn format_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return "No results found.".to_string();
    }
    results
        .iter()
        .map(|r| format!("Title: {}\nLink: {}\nSnippet: {}", r.title, r.url, r.snippet))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

/// Google search via serper.dev. Needs `SERPER_API_KEY`.
#[derive(Debug, Clone)]
pub struct SerperDevTool {
    api_key: Option<String>,
    /// Results per query.
    pub n_results: usize,
    client: reqwest::Client,
}

impl SerperDevTool {
    pub fn new() -> Result<Self, ToolError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            api_key: Self::api_key_var().read(),
            n_results: 10,
            client,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn api_key_var() -> EnvVar {
        EnvVar::new("SERPER_API_KEY", "API key for serper.dev search")
    }

    /// Parse the `organic` section of a Serper response.
    pub fn parse_results(response: &Value, limit: usize) -> Vec<SearchResult> {
        response
            .get("organic")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .take(limit)
                    .map(|item| SearchResult {
                        title: string_field(item, "title"),
                        url: string_field(item, "link"),
                        snippet: string_field(item, "snippet"),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn string_field(item: &Value, key: &str) -> String {
    item.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

#[async_trait]
impl SearchTool for SerperDevTool {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>, ToolError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ToolError::fatal("SERPER_API_KEY is not set"))?;
        if query.trim().is_empty() {
            return Err(ToolError::invalid_input("search query is empty"));
        }

        log::debug!("serper search: {}", query);
        let response = self
            .client
            .post(SERPER_ENDPOINT)
            .header("X-API-KEY", api_key)
            .json(&json!({"q": query, "num": self.n_results}))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ToolError::from_status(status, &body));
        }

        let json: Value = serde_json::from_str(&body)
            .map_err(|e| ToolError::transient(format!("invalid search response: {}", e)))?;
        Ok(Self::parse_results(&json, self.n_results))
    }
}

#[async_trait]
impl BaseTool for SerperDevTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Search the internet. Input: {\"search_query\": \"<query>\"}. Returns titles, links and snippets."
    }

    fn env_vars(&self) -> Vec<EnvVar> {
        vec![Self::api_key_var()]
    }

    async fn run(&self, input: &str) -> Result<String, ToolError> {
        let query = extract_argument(input, &["search_query", "query", "q"]);
        let results = self.search(&query).await?;
        Ok(format_results(&results))
    }
}
