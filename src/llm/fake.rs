//! In-process backends for tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{BackendRequest, BackendResponse, ReasoningBackend};
use crate::error::{Error, Result};

type Script = dyn Fn(&BackendRequest) -> Result<BackendResponse> + Send + Sync;

/// Answers every request through a closure and keeps the prompts it saw.
pub(crate) struct ScriptedBackend {
    script: Box<Script>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    pub(crate) fn new<F>(script: F) -> Self
    where
        F: Fn(&BackendRequest) -> Result<BackendResponse> + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always returns the same answer.
    pub(crate) fn constant(answer: &str) -> Self {
        let answer = answer.to_string();
        Self::new(move |_| {
            Ok(BackendResponse {
                answer: answer.clone(),
                tokens: 10,
            })
        })
    }

    /// Always fails.
    pub(crate) fn failing() -> Self {
        Self::new(|_| Err(Error::backend("scripted", "unavailable")))
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    async fn invoke(&self, request: BackendRequest) -> Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(request.prompt.clone());
        }
        (self.script)(&request)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Never answers; used to exercise cancellation.
pub(crate) struct PendingBackend;

#[async_trait]
impl ReasoningBackend for PendingBackend {
    async fn invoke(&self, _request: BackendRequest) -> Result<BackendResponse> {
        std::future::pending::<()>().await;
        Err(Error::Internal("unreachable".to_string()))
    }

    fn name(&self) -> &str {
        "pending"
    }
}
