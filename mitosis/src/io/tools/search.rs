//! `web_search`: instant-answer lookup over HTTP.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ToolExecutionError;
use crate::io::config::SearchConfig;
use crate::io::tools::{Tool, ToolOutput, ToolRequest};

pub const NAME: &str = "web_search";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct InstantAnswer {
    #[serde(rename = "Heading")]
    heading: String,
    #[serde(rename = "AbstractText")]
    abstract_text: String,
    #[serde(rename = "AbstractURL")]
    abstract_url: String,
    #[serde(rename = "RelatedTopics")]
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RelatedTopic {
    #[serde(rename = "Text")]
    text: Option<String>,
    #[serde(rename = "FirstURL")]
    first_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SearchHit {
    title: String,
    url: String,
}

pub struct WebSearchTool {
    http: reqwest::Client,
    endpoint: String,
    max_results: usize,
}

impl WebSearchTool {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            max_results: config.max_results.max(1),
        }
    }
}

/// The query is the step description unless it is empty.
fn query_for(request: &ToolRequest) -> String {
    let description = request.step_description.trim();
    if description.is_empty() {
        request.task_title.clone()
    } else {
        description.to_string()
    }
}

fn collect_hits(answer: &InstantAnswer, max_results: usize) -> Vec<SearchHit> {
    let mut hits = Vec::new();
    if !answer.abstract_text.is_empty() {
        hits.push(SearchHit {
            title: format!("{}: {}", answer.heading, answer.abstract_text),
            url: answer.abstract_url.clone(),
        });
    }
    hits.extend(answer.related_topics.iter().filter_map(|topic| {
        Some(SearchHit {
            title: topic.text.clone()?,
            url: topic.first_url.clone().unwrap_or_default(),
        })
    }));
    hits.truncate(max_results);
    hits
}

fn summarize(query: &str, hits: &[SearchHit]) -> String {
    let mut out = format!("Search results for \"{query}\":");
    for (idx, hit) in hits.iter().enumerate() {
        out.push_str(&format!("\n{}. {}", idx + 1, hit.title));
        if !hit.url.is_empty() {
            out.push_str(&format!(" ({})", hit.url));
        }
    }
    out
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Search the web and summarize the top results for a query."
    }

    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        let query = query_for(request);
        let resp = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query.as_str()), ("format", "json"), ("no_html", "1")])
            .send()
            .await
            .map_err(|e| ToolExecutionError::failed(NAME, e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ToolExecutionError::failed(
                NAME,
                format!("search endpoint returned {}", resp.status()),
            ));
        }
        let answer: InstantAnswer = resp
            .json()
            .await
            .map_err(|e| ToolExecutionError::failed(NAME, format!("decode response: {e}")))?;

        let hits = collect_hits(&answer, self.max_results);
        debug!(query = %query, hits = hits.len(), "search finished");
        if hits.is_empty() {
            return Err(ToolExecutionError::failed(
                NAME,
                format!("no results for \"{query}\""),
            ));
        }
        let data = json!({
            "query": query,
            "results": hits
                .iter()
                .map(|hit| json!({ "title": hit.title, "url": hit.url }))
                .collect::<Vec<_>>(),
        });
        Ok(ToolOutput {
            summary: summarize(&query, &hits),
            data,
        })
    }
}
