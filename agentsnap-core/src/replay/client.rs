//! Mock LLM client serving recorded responses

use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use super::ReplayConfig;
use crate::diff::StructuralDiff;
use crate::error::{Result, SnapshotError};
use crate::llm::{ChunkStream, LlmChunk, LlmClient, LlmRequest, LlmResponse, ModelInfo};
use crate::normalize::PayloadKind;
use crate::record::RecordedResponse;
use crate::session::RunSession;
use crate::store::SnapshotStore;

/// How a request is answered
enum Served {
    /// From the loop record at this index
    Recorded {
        loop_index: usize,
        response: RecordedResponse,
    },
    /// By the agent's original client (update mode past the last record)
    Forward {
        loop_index: usize,
        client: Arc<dyn LlmClient>,
    },
}

/// LLM client answering from a snapshot case
pub struct ReplayLlmClient {
    store: Arc<dyn SnapshotStore>,
    session: Arc<RunSession>,
    config: ReplayConfig,
    expected_loops: usize,
    fallback: Option<Arc<dyn LlmClient>>,
}

impl ReplayLlmClient {
    pub(crate) fn new(
        store: Arc<dyn SnapshotStore>,
        session: Arc<RunSession>,
        config: ReplayConfig,
        expected_loops: usize,
        fallback: Option<Arc<dyn LlmClient>>,
    ) -> Self {
        Self {
            store,
            session,
            config,
            expected_loops,
            fallback,
        }
    }

    /// Number of loops recorded in the case
    pub fn expected_loops(&self) -> usize {
        self.expected_loops
    }

    pub fn has_error(&self) -> bool {
        self.session.has_error()
    }

    pub fn last_error(&self) -> Option<SnapshotError> {
        self.session.last_error()
    }

    pub fn clear_error(&self) {
        self.session.clear_error();
    }

    /// Record a failure in the session and hand it back to the caller
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.session.fail(err.clone());
        }
        result
    }

    /// Resolve which response answers the request at the loop pointer
    fn prepare(&self, request: &LlmRequest) -> Result<Served> {
        if let Some(err) = self.session.last_error() {
            return Err(err);
        }

        let loop_index = self.session.current_loop();
        let normalizer = &self.config.normalizer;
        let live = normalizer.normalize_serialize(PayloadKind::Request, request)?;
        self.session.stage_request(loop_index, live.clone());

        tracing::debug!(
            case = %self.session.case(),
            loop_index = loop_index,
            expected = self.expected_loops,
            request_sha256 = %short_sha256(live.to_string().as_bytes()),
            "Replaying LLM request"
        );

        if loop_index >= self.expected_loops {
            if self.config.update_snapshots
                && let Some(client) = &self.fallback
            {
                tracing::info!(
                    case = %self.session.case(),
                    loop_index = loop_index,
                    "Loop beyond the recorded case, forwarding to the live client"
                );
                return Ok(Served::Forward {
                    loop_index,
                    client: Arc::clone(client),
                });
            }
            return Err(SnapshotError::UnexpectedLoop {
                loop_index,
                expected: self.expected_loops,
            });
        }

        let record = self.store.read(self.session.case(), loop_index)?;

        if self.config.verification.verify_llm_requests {
            let stored = normalizer.normalize(PayloadKind::Request, &record.request);
            let diff = StructuralDiff::compute(&stored, &live);
            if !diff.is_empty() {
                if !self.config.update_snapshots {
                    return Err(SnapshotError::RequestMismatch { loop_index, diff });
                }
                tracing::info!(
                    case = %self.session.case(),
                    loop_index = loop_index,
                    differences = diff.len(),
                    "Request diverged, live request replaces the recorded one"
                );
            }
        }

        Ok(Served::Recorded {
            loop_index,
            response: record.response,
        })
    }

    async fn forward_complete(
        &self,
        loop_index: usize,
        client: &dyn LlmClient,
        request: &LlmRequest,
    ) -> Result<LlmResponse> {
        let response = client.complete(request).await?;
        let normalized = self
            .config
            .normalizer
            .normalize_serialize(PayloadKind::Response, &response)?;
        self.session
            .stage_response(loop_index, RecordedResponse::Message(normalized));
        self.session.advance_past(loop_index);
        Ok(response)
    }

    async fn forward_stream(
        &self,
        loop_index: usize,
        client: &dyn LlmClient,
        request: &LlmRequest,
    ) -> Result<ChunkStream> {
        let chunks: Vec<LlmChunk> = client.stream(request).await?.try_collect().await?;
        let normalized = chunks
            .iter()
            .map(|chunk| {
                self.config
                    .normalizer
                    .normalize_serialize(PayloadKind::Response, chunk)
            })
            .collect::<Result<Vec<_>>>()?;
        self.session
            .stage_response(loop_index, RecordedResponse::Chunks(normalized));
        self.session.advance_past(loop_index);
        Ok(Box::pin(futures::stream::iter(chunks.into_iter().map(Ok))))
    }
}

#[async_trait]
impl LlmClient for ReplayLlmClient {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let result = match self.prepare(request) {
            Ok(Served::Recorded {
                loop_index,
                response,
            }) => response.to_response().map(|assembled| {
                self.session.stage_response(loop_index, response);
                self.session.advance_past(loop_index);
                assembled
            }),
            Ok(Served::Forward { loop_index, client }) => {
                self.forward_complete(loop_index, client.as_ref(), request)
                    .await
            }
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    async fn stream(&self, request: &LlmRequest) -> Result<ChunkStream> {
        let result = match self.prepare(request) {
            Ok(Served::Recorded {
                loop_index,
                response,
            }) => response.to_chunks().map(|chunks| {
                self.session.stage_response(loop_index, response);
                Box::pin(ReplayChunkStream::new(
                    chunks,
                    Arc::clone(&self.session),
                    loop_index,
                )) as ChunkStream
            }),
            Ok(Served::Forward { loop_index, client }) => {
                self.forward_stream(loop_index, client.as_ref(), request)
                    .await
            }
            Err(err) => Err(err),
        };
        self.settle(result)
    }

    fn model_info(&self) -> ModelInfo {
        match &self.fallback {
            Some(client) => client.model_info(),
            None => ModelInfo {
                provider: "replay".to_string(),
                model_name: "replay".to_string(),
            },
        }
    }
}

/// Finite stream over recorded chunks.
///
/// Chunks are yielded in recorded order with no delay. The loop pointer
/// moves past the loop only when the stream reports exhaustion, so a
/// consumer that stops early leaves the pointer where it was.
pub struct ReplayChunkStream {
    chunks: VecDeque<LlmChunk>,
    session: Arc<RunSession>,
    loop_index: usize,
    done: bool,
}

impl ReplayChunkStream {
    fn new(chunks: Vec<LlmChunk>, session: Arc<RunSession>, loop_index: usize) -> Self {
        Self {
            chunks: chunks.into(),
            session,
            loop_index,
            done: false,
        }
    }

    /// Chunks not yet delivered
    fn remaining(&self) -> usize {
        self.chunks.len()
    }
}

impl Stream for ReplayChunkStream {
    type Item = Result<LlmChunk>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.chunks.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        if !self.done {
            self.done = true;
            self.session.advance_past(self.loop_index);
        }
        Poll::Ready(None)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

fn short_sha256(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(12);
    for b in &digest[..6] {
        let _ = write!(out, "{b:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::LoopRecord;
    use crate::session::SnapshotMode;
    use crate::store::InMemorySnapshotStore;
    use futures::StreamExt;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn recorded_case(store: &InMemorySnapshotStore, normalizer: &crate::normalize::Normalizer) {
        let request = LlmRequest::from_prompt("m", "hello");
        let request = normalizer
            .normalize_serialize(PayloadKind::Request, &request)
            .unwrap();
        let chunks = vec![json!(LlmChunk::text("Hel")), json!(LlmChunk::text("lo"))];
        store
            .write(
                "case",
                &LoopRecord::new(0, request, RecordedResponse::Chunks(chunks)),
            )
            .unwrap();
    }

    fn client(store: Arc<InMemorySnapshotStore>) -> (Arc<RunSession>, ReplayLlmClient) {
        let session = Arc::new(RunSession::new(
            "case",
            SnapshotMode::Replay,
            Arc::new(AtomicUsize::new(0)),
        ));
        let client = ReplayLlmClient::new(store, Arc::clone(&session), ReplayConfig::default(), 1, None);
        (session, client)
    }

    #[tokio::test]
    async fn test_stream_advances_on_exhaustion() {
        let store = Arc::new(InMemorySnapshotStore::new());
        recorded_case(&store, &crate::normalize::Normalizer::default());
        let (session, client) = client(store);

        let mut stream = client
            .stream(&LlmRequest::from_prompt("m", "hello"))
            .await
            .unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().content.as_deref(), Some("Hel"));
        assert_eq!(session.current_loop(), 0);
        assert_eq!(stream.next().await.unwrap().unwrap().content.as_deref(), Some("lo"));
        assert_eq!(session.current_loop(), 0);
        assert!(stream.next().await.is_none());
        assert_eq!(session.current_loop(), 1);
        assert!(stream.next().await.is_none());
        assert_eq!(session.current_loop(), 1);
    }

    #[tokio::test]
    async fn test_chunks_assembled_for_blocking_call() {
        let store = Arc::new(InMemorySnapshotStore::new());
        recorded_case(&store, &crate::normalize::Normalizer::default());
        let (session, client) = client(store);

        let response = client
            .complete(&LlmRequest::from_prompt("m", "hello"))
            .await
            .unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello"));
        assert_eq!(session.current_loop(), 1);
    }

    #[tokio::test]
    async fn test_request_past_case_is_unexpected() {
        let store = Arc::new(InMemorySnapshotStore::new());
        recorded_case(&store, &crate::normalize::Normalizer::default());
        let (session, client) = client(store);

        client
            .complete(&LlmRequest::from_prompt("m", "hello"))
            .await
            .unwrap();
        let err = client
            .complete(&LlmRequest::from_prompt("m", "again"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::UnexpectedLoop {
                loop_index: 1,
                expected: 1
            }
        ));
        assert!(client.has_error());
        assert_eq!(session.current_loop(), 1);

        client.clear_error();
        assert!(client.last_error().is_none());
    }

    #[tokio::test]
    async fn test_request_mismatch() {
        let store = Arc::new(InMemorySnapshotStore::new());
        recorded_case(&store, &crate::normalize::Normalizer::default());
        let (session, client) = client(store);

        let err = client
            .complete(&LlmRequest::from_prompt("m", "goodbye"))
            .await
            .unwrap_err();
        match err {
            SnapshotError::RequestMismatch { loop_index, diff } => {
                assert_eq!(loop_index, 0);
                let field = diff.at("messages[0].content").unwrap();
                assert_eq!(field.expected, Some(json!("hello")));
                assert_eq!(field.actual, Some(json!("goodbye")));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(session.current_loop(), 0);
    }

    #[test]
    fn test_short_sha256() {
        let digest = short_sha256(b"abc");
        assert_eq!(digest.len(), 12);
        assert_eq!(digest, "ba7816bf8f01");
    }
}
