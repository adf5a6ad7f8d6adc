//! Reasoning backend abstraction.
//!
//! Agents, reflection and the group-E self check all talk to the model through
//! [`ReasoningBackend`]. The production implementation is [`DifyClient`], which
//! speaks the workflow, completion and chat endpoints of a Dify application.

mod client;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::task::TaskKind;

pub use client::{build_http_client, extract_workflow_answer, retry_backoff, DifyClient};

/// One backend invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Fully rendered prompt
    pub prompt: String,
    /// Raw task input, passed separately for workflow apps
    pub input: String,
    pub task_type: TaskKind,
}

impl BackendRequest {
    pub fn new(prompt: impl Into<String>, input: impl Into<String>, task_type: TaskKind) -> Self {
        Self {
            prompt: prompt.into(),
            input: input.into(),
            task_type,
        }
    }
}

/// Answer text and the token cost reported by the backend (0 when unknown).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResponse {
    pub answer: String,
    pub tokens: i64,
}

/// Something that turns a prompt into an answer.
///
/// Implementations must be safe to retry: a timed-out call may be repeated by
/// the transport, and a cancelled call is simply dropped mid-flight.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse>;

    /// Short identifier used in logs and error values.
    fn name(&self) -> &str;
}
