//! Scripted LLM client for tests and demos
//!
//! Returns predetermined responses in order. By default it also injects the
//! run-specific noise a real provider produces (random response ids, random
//! tool-call ids, creation timestamps) so that snapshot normalization is
//! exercised the same way it would be against a live model.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

use super::{ChunkStream, LlmChunk, LlmClient, LlmRequest, LlmResponse, ModelInfo};
use crate::error::{Result, SnapshotError};

/// LLM client that replays a fixed script of responses
pub struct ScriptedLlmClient {
    model: String,
    responses: Vec<LlmResponse>,
    call_count: AtomicUsize,
    history: Arc<RwLock<Vec<LlmRequest>>>,
    words_per_chunk: usize,
    noisy: bool,
}

impl ScriptedLlmClient {
    /// Create a client returning `responses` in order
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            model: "scripted-model".to_string(),
            responses,
            call_count: AtomicUsize::new(0),
            history: Arc::new(RwLock::new(Vec::new())),
            words_per_chunk: 1,
            noisy: true,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Number of words carried by each streamed chunk
    pub fn with_words_per_chunk(mut self, words: usize) -> Self {
        self.words_per_chunk = words.max(1);
        self
    }

    /// Disable generated ids and timestamps
    pub fn deterministic(mut self) -> Self {
        self.noisy = false;
        self
    }

    /// Number of requests served
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Requests received, in order
    pub async fn requests(&self) -> Vec<LlmRequest> {
        self.history.read().await.clone()
    }

    async fn next_response(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.history.write().await.push(request.clone());
        let index = self.call_count.fetch_add(1, Ordering::SeqCst);

        let mut response = self.responses.get(index).cloned().ok_or_else(|| {
            SnapshotError::Llm(format!(
                "Scripted client exhausted: request {} but only {} responses scripted",
                index + 1,
                self.responses.len()
            ))
        })?;

        if response.model.is_empty() {
            response.model = self.model.clone();
        }

        if self.noisy {
            response.id = format!("resp-{}", uuid::Uuid::new_v4());
            response.created = Some(Utc::now());
            for call in &mut response.tool_calls {
                call.id = format!("call_{}", uuid::Uuid::new_v4().simple());
            }
        } else {
            response.id = format!("resp-{}", index);
            for (i, call) in response.tool_calls.iter_mut().enumerate() {
                if call.id.is_empty() {
                    call.id = format!("call_{}_{}", index, i);
                }
            }
        }

        tracing::debug!(call = index, model = %self.model, "Scripted LLM response");
        Ok(response)
    }

    fn split_into_chunks(&self, response: &LlmResponse) -> Vec<LlmChunk> {
        let mut chunks: Vec<LlmChunk> = Vec::new();

        if let Some(content) = &response.content {
            let words: Vec<&str> = content.split_inclusive(' ').collect();
            for group in words.chunks(self.words_per_chunk) {
                chunks.push(LlmChunk::text(group.concat()));
            }
        }

        match chunks.last_mut() {
            Some(last) => {
                last.tool_calls = response.tool_calls.clone();
                last.finish_reason = response.finish_reason.clone();
            }
            None => chunks.push(LlmChunk {
                content: None,
                tool_calls: response.tool_calls.clone(),
                finish_reason: response.finish_reason.clone(),
            }),
        }

        chunks
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.next_response(request).await
    }

    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream> {
        let response = self.next_response(request).await?;
        let chunks: Vec<Result<LlmChunk>> =
            self.split_into_chunks(&response).into_iter().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "scripted".to_string(),
            model_name: self.model.clone(),
        }
    }
}
