//! Optional external memory service (MemOS product API).
//!
//! The harness works with this collaborator disabled. When it is enabled,
//! failures degrade to "no external memory" and are only logged.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ExternalMemoryConfig;
use crate::error::{Error, Result};
use crate::llm::build_http_client;
use crate::task::TaskKind;

/// Queries longer than this are cut before being sent.
pub const MAX_QUERY_CHARS: usize = 800;

/// One search result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalHit {
    pub id: String,
    pub content: String,
    /// 0 when the service does not score results
    pub score: f64,
}

#[async_trait]
pub trait ExternalMemory: Send + Sync {
    async fn register(&self, user_id: &str) -> Result<()>;
    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<ExternalHit>>;
    async fn add(&self, user_id: &str, content: &str, source: &str) -> Result<()>;
}

/// External user id for a task type.
pub fn external_user_id(prefix: &str, task_type: TaskKind) -> String {
    format!("{}:{}", prefix, task_type)
}

/// Search query for an input, capped at [`MAX_QUERY_CHARS`] characters.
pub fn build_search_query(task_type: TaskKind, input: &str) -> String {
    let query = format!("task_type={} input={}", task_type, input.trim());
    query.chars().take(MAX_QUERY_CHARS).collect()
}

/// Provenance tag attached to rules pushed to the service.
pub fn source_tag(group: &str, run_id: i64, trial_id: i64, memory_id: i64) -> String {
    format!(
        "memlab|exp|group={}|run_id={}|task_id={}|memory_id={}",
        group, run_id, trial_id, memory_id
    )
}

fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn as_score(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

fn hit_from_object(obj: &serde_json::Map<String, Value>) -> ExternalHit {
    ExternalHit {
        id: as_string(obj.get("id")),
        content: as_string(obj.get("content")),
        score: as_score(obj.get("score")),
    }
}

/// Parse a search response body. The payload shape varies across service
/// versions: `data.text_mem` (strings or objects), `data.references`, or
/// `data` as a plain list of strings.
pub fn parse_search_payload(raw: &str) -> Result<Vec<ExternalHit>> {
    let body: Value = serde_json::from_str(raw)
        .map_err(|e| Error::ExternalMemory(format!("bad search response: {}", e)))?;
    let data = body.get("data").cloned().unwrap_or(Value::Null);

    let mut hits = Vec::new();
    if let Some(items) = data.get("text_mem").and_then(Value::as_array) {
        for item in items {
            match item {
                Value::String(s) => hits.push(ExternalHit {
                    content: s.clone(),
                    ..ExternalHit::default()
                }),
                Value::Object(obj) => hits.push(hit_from_object(obj)),
                _ => {}
            }
        }
    }
    if hits.is_empty() {
        if let Some(items) = data.get("references").and_then(Value::as_array) {
            hits.extend(items.iter().filter_map(Value::as_object).map(hit_from_object));
        }
    }
    if hits.is_empty() {
        if let Some(items) = data.as_array() {
            hits.extend(items.iter().filter_map(Value::as_str).map(|s| ExternalHit {
                content: s.to_string(),
                ..ExternalHit::default()
            }));
        }
    }
    Ok(hits)
}

/// A 2xx body carrying a non-empty `detail` is a server-side traceback.
fn check_detail(raw: &str) -> Result<()> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(raw) {
        let detail = as_string(obj.get("detail"));
        if !detail.trim().is_empty() {
            let cut: String = detail.trim().chars().take(300).collect();
            return Err(Error::ExternalMemory(format!("detail={}", cut)));
        }
    }
    Ok(())
}

/// MemOS product API client.
pub struct MemosClient {
    base_url: String,
    top_k: usize,
    http: Client,
}

impl MemosClient {
    /// Returns `Ok(None)` when the service is disabled in config.
    pub fn from_config(config: &ExternalMemoryConfig) -> Result<Option<Self>> {
        if !config.enabled() {
            return Ok(None);
        }
        Ok(Some(Self {
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            top_k: if config.top_k == 0 { 5 } else { config.top_k },
            http: build_http_client(config.timeout_secs)?,
        }))
    }

    async fn post(&self, path: &str, body: Value) -> Result<String> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ExternalMemory(format!("{} failed: {}", path, e)))?;
        let status = response.status();
        let raw = response
            .text()
            .await
            .map_err(|e| Error::ExternalMemory(format!("{} unreadable: {}", path, e)))?;
        if !status.is_success() {
            let cut: String = raw.trim().chars().take(300).collect();
            return Err(Error::ExternalMemory(format!("{} http={} body={}", path, status.as_u16(), cut)));
        }
        check_detail(&raw)?;
        Ok(raw)
    }
}

#[async_trait]
impl ExternalMemory for MemosClient {
    async fn register(&self, user_id: &str) -> Result<()> {
        self.post("/product/users/register", json!({ "user_id": user_id }))
            .await
            .map(|_| ())
    }

    async fn search(&self, user_id: &str, query: &str) -> Result<Vec<ExternalHit>> {
        let raw = self
            .post(
                "/product/search",
                json!({ "user_id": user_id, "query": query, "top_k": self.top_k }),
            )
            .await?;
        let hits = parse_search_payload(&raw)?;
        debug!(user_id, hits = hits.len(), "External memory search");
        Ok(hits)
    }

    async fn add(&self, user_id: &str, content: &str, source: &str) -> Result<()> {
        self.post(
            "/product/add",
            json!({ "user_id": user_id, "memory_content": content, "source": source }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records adds and serves fixed search hits.
    #[derive(Default)]
    pub(crate) struct RecordingMemory {
        pub(crate) hits: Vec<ExternalHit>,
        pub(crate) added: Mutex<Vec<(String, String, String)>>,
        pub(crate) searches: Mutex<Vec<(String, String)>>,
    }

    impl RecordingMemory {
        pub(crate) fn with_hits(hits: Vec<ExternalHit>) -> Self {
            Self {
                hits,
                ..Self::default()
            }
        }

        pub(crate) fn added(&self) -> Vec<(String, String, String)> {
            self.added.lock().map(|a| a.clone()).unwrap_or_default()
        }

        pub(crate) fn searches(&self) -> Vec<(String, String)> {
            self.searches.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl ExternalMemory for RecordingMemory {
        async fn register(&self, _user_id: &str) -> Result<()> {
            Ok(())
        }

        async fn search(&self, user_id: &str, query: &str) -> Result<Vec<ExternalHit>> {
            if let Ok(mut searches) = self.searches.lock() {
                searches.push((user_id.to_string(), query.to_string()));
            }
            Ok(self.hits.clone())
        }

        async fn add(&self, user_id: &str, content: &str, source: &str) -> Result<()> {
            if let Ok(mut added) = self.added.lock() {
                added.push((user_id.to_string(), content.to_string(), source.to_string()));
            }
            Ok(())
        }
    }
}
