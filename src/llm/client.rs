//! HTTP client for a Dify prompt application.

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use tracing::{debug, warn};

use super::{BackendRequest, BackendResponse, ReasoningBackend};
use crate::config::{AppMode, BackendConfig};
use crate::error::{Error, Result};

const BACKEND_NAME: &str = "dify";
const REQUEST_USER: &str = "experiment";
const BACKOFF_BASE: Duration = Duration::from_millis(300);
const BACKOFF_CAP: Duration = Duration::from_secs(3);
const MAX_JITTER_MS: u64 = 200;
const ERROR_BODY_CHARS: usize = 300;

/// Build a reqwest client with the given timeout.
///
/// Proxy auto-detection can panic inside the default builder on some
/// sandboxed hosts; a no-proxy client is built instead in that case.
pub fn build_http_client(timeout_secs: u64) -> Result<Client> {
    let timeout = Duration::from_secs(timeout_secs);
    match catch_unwind(AssertUnwindSafe(|| Client::builder().timeout(timeout).build())) {
        Ok(Ok(client)) => Ok(client),
        Ok(Err(_)) | Err(_) => Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::backend(BACKEND_NAME, format!("failed to build HTTP client: {}", e))),
    }
}

/// Delay before retry number `attempt` (1-based), without jitter:
/// 300ms doubling per attempt, capped at 3s.
pub fn retry_backoff(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}

fn jittered_backoff(attempt: u32) -> Duration {
    retry_backoff(attempt) + Duration::from_millis(rand::thread_rng().gen_range(0..MAX_JITTER_MS))
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_transport(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

fn truncate(text: &str, limit: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(limit) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Pick the answer out of workflow outputs: the configured key, then the
/// usual names, then the first non-empty string, then the whole map as JSON.
pub fn extract_workflow_answer(outputs: &Map<String, Value>, output_key: Option<&str>) -> String {
    fn render(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    let preferred = output_key
        .filter(|k| !k.is_empty())
        .into_iter()
        .chain(["answer", "text", "output", "result"]);
    for key in preferred {
        if let Some(value) = outputs.get(key) {
            return render(value);
        }
    }
    if let Some(text) = outputs.values().find_map(|v| match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }) {
        return text;
    }
    if outputs.is_empty() {
        return String::new();
    }
    Value::Object(outputs.clone()).to_string()
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    inputs: Value,
    query: &'a str,
    response_mode: &'a str,
    user: &'a str,
}

#[derive(Debug, Serialize)]
struct WorkflowRequest<'a> {
    inputs: Value,
    response_mode: &'a str,
    user: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: i64,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Default, Deserialize)]
struct WorkflowData {
    #[serde(default)]
    outputs: Option<Map<String, Value>>,
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WorkflowResponse {
    #[serde(default)]
    data: WorkflowData,
}

/// Dify application client.
pub struct DifyClient {
    config: BackendConfig,
    http: Client,
}

impl DifyClient {
    pub fn new(config: BackendConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(Error::Config("backend.base_url is not set".to_string()));
        }
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim().trim_end_matches('/')
    }

    /// POST with retries on 429/5xx and timeouts. Returns the response body.
    async fn post(&self, endpoint: &str, body: &impl Serialize) -> Result<String> {
        let url = format!("{}{}", self.base_url(), endpoint);
        let retries = self.config.effective_retries();
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .http
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await;

            let response = match outcome {
                Ok(response) => response,
                Err(e) if attempt < retries && is_retryable_transport(&e) => {
                    attempt += 1;
                    let sleep = jittered_backoff(attempt);
                    warn!(endpoint, attempt, retries, ?sleep, error = %e, "Retrying backend call");
                    tokio::time::sleep(sleep).await;
                    continue;
                }
                Err(e) => {
                    return Err(Error::backend(BACKEND_NAME, format!("HTTP request failed: {}", e)))
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| Error::backend(BACKEND_NAME, format!("Failed to read response: {}", e)))?;

            if status.is_success() {
                return Ok(text);
            }
            if attempt < retries && is_retryable_status(status) {
                attempt += 1;
                let sleep = jittered_backoff(attempt);
                warn!(endpoint, attempt, retries, ?sleep, status = status.as_u16(), "Retrying backend call");
                tokio::time::sleep(sleep).await;
                continue;
            }
            return Err(Error::backend(
                BACKEND_NAME,
                format!("{} returned {}: {}", endpoint, status, truncate(&text, ERROR_BODY_CHARS)),
            ));
        }
    }

    async fn message(&self, endpoint: &str, request: &BackendRequest) -> Result<BackendResponse> {
        let body = MessageRequest {
            inputs: json!({
                "task_type": request.task_type.as_str(),
                "input": request.input,
            }),
            query: &request.prompt,
            response_mode: &self.config.response_mode,
            user: REQUEST_USER,
        };
        let raw = self.post(endpoint, &body).await?;
        let parsed: MessageResponse = serde_json::from_str(&raw)
            .map_err(|e| Error::backend(BACKEND_NAME, format!("bad {} response: {}", endpoint, e)))?;
        Ok(BackendResponse {
            answer: parsed.answer,
            tokens: parsed.metadata.usage.total_tokens,
        })
    }

    async fn workflow(&self, request: &BackendRequest) -> Result<BackendResponse> {
        let mut inputs = Map::new();
        inputs.insert(self.config.workflow_system_key.clone(), Value::String(request.prompt.clone()));
        inputs.insert(self.config.workflow_query_key.clone(), Value::String(request.input.clone()));
        let body = WorkflowRequest {
            inputs: Value::Object(inputs),
            response_mode: &self.config.response_mode,
            user: REQUEST_USER,
        };
        let raw = self.post("/workflows/run", &body).await?;
        let parsed: WorkflowResponse = serde_json::from_str(&raw)
            .map_err(|e| Error::backend(BACKEND_NAME, format!("bad workflow response: {}", e)))?;
        if let Some(err) = parsed.data.error.filter(|e| !e.trim().is_empty()) {
            return Err(Error::backend(
                BACKEND_NAME,
                format!("workflow {}: {}", parsed.data.status, truncate(&err, ERROR_BODY_CHARS)),
            ));
        }
        let answer = parsed
            .data
            .outputs
            .map(|outputs| extract_workflow_answer(&outputs, self.config.workflow_output_key.as_deref()))
            .unwrap_or_default();
        Ok(BackendResponse { answer, tokens: 0 })
    }
}

#[async_trait]
impl ReasoningBackend for DifyClient {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse> {
        if self.config.app_mode == AppMode::Workflow {
            return self.workflow(&request).await;
        }

        let completion_err = match self.message("/completions", &request).await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };
        debug!(error = %completion_err, "Completion endpoint failed, trying chat");

        self.message("/chat-messages", &request).await.map_err(|chat_err| {
            Error::backend(
                BACKEND_NAME,
                format!(
                    "all endpoints failed (app_mode={}): completion({}), chat({})",
                    self.config.app_mode, completion_err, chat_err
                ),
            )
        })
    }

    fn name(&self) -> &str {
        BACKEND_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_backoff_doubles_and_caps() {
        assert_eq!(retry_backoff(1), Duration::from_millis(300));
        assert_eq!(retry_backoff(2), Duration::from_millis(600));
        assert_eq!(retry_backoff(3), Duration::from_millis(1200));
        assert_eq!(retry_backoff(4), Duration::from_millis(2400));
        assert_eq!(retry_backoff(5), Duration::from_secs(3));
        assert_eq!(retry_backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..50 {
            let d = jittered_backoff(1);
            assert!(d >= Duration::from_millis(300));
            assert!(d < Duration::from_millis(500));
        }
    }

    #[test]
    fn test_retryable_status() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }

    fn outputs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_workflow_answer_selection() {
        let out = outputs(json!({"answer": "a", "custom": "c"}));
        assert_eq!(extract_workflow_answer(&out, Some("custom")), "c");
        assert_eq!(extract_workflow_answer(&out, None), "a");
        assert_eq!(extract_workflow_answer(&out, Some("")), "a");

        let structured = outputs(json!({"result": {"allow": true}}));
        assert_eq!(extract_workflow_answer(&structured, None), r#"{"allow":true}"#);

        let odd = outputs(json!({"n": 1, "msg": "hello"}));
        assert_eq!(extract_workflow_answer(&odd, None), "hello");

        let numbers = outputs(json!({"n": 1}));
        assert_eq!(extract_workflow_answer(&numbers, None), r#"{"n":1}"#);

        assert_eq!(extract_workflow_answer(&Map::new(), None), "");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("  short ", 10), "short");
        assert_eq!(truncate("积分积分积分", 2), "积分...");
    }

    #[test]
    fn test_client_requires_base_url() {
        assert!(matches!(DifyClient::new(BackendConfig::default()), Err(Error::Config(_))));
        let client = DifyClient::new(BackendConfig::new("http://localhost:5001/v1/", "key")).unwrap();
        assert_eq!(client.base_url(), "http://localhost:5001/v1");
        assert_eq!(client.name(), "dify");
    }

    #[test]
    fn test_message_request_shape() {
        let body = MessageRequest {
            inputs: json!({"task_type": "lottery", "input": "{}"}),
            query: "prompt",
            response_mode: "blocking",
            user: REQUEST_USER,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["query"], "prompt");
        assert_eq!(value["user"], "experiment");
        assert_eq!(value["inputs"]["task_type"], "lottery");
    }

    #[test]
    fn test_message_response_tolerates_missing_usage() {
        let parsed: MessageResponse = serde_json::from_str(r#"{"answer": "x"}"#).unwrap();
        assert_eq!(parsed.answer, "x");
        assert_eq!(parsed.metadata.usage.total_tokens, 0);
        let parsed: MessageResponse =
            serde_json::from_str(r#"{"answer": "y", "metadata": {"usage": {"total_tokens": 42}}}"#).unwrap();
        assert_eq!(parsed.metadata.usage.total_tokens, 42);
    }
}
