//! Reference tool-calling loop agent
//!
//! Each loop iteration sends the conversation to the LLM. If the model asks
//! for tools, they are executed, their results appended to the conversation
//! and the next iteration starts. A response without tool calls is the final
//! answer. The loop stops after `max_loops` iterations regardless.
//!
//! The streaming variant is lazy: nothing runs until the stream is polled and
//! dropping it stops the agent between two chunks.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AgentInput, AgentTool, EventStream, LoopHooks, SnapshotAgent, ToolCallRecord};
use crate::error::{Result, SnapshotError};
use crate::events::{AgentEvent, EventEnvelope, EventLog};
use crate::llm::{LlmClient, LlmRequest, LlmResponse, Message, ToolCall};

const DEFAULT_MAX_LOOPS: usize = 10;

/// Reference agent running a bounded LLM/tool loop
#[derive(Clone)]
pub struct LoopAgent {
    inner: Arc<LoopAgentInner>,
}

struct LoopAgentInner {
    name: String,
    system_prompt: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
    max_loops: usize,
    tools: Vec<Arc<dyn AgentTool>>,
    client: RwLock<Arc<dyn LlmClient>>,
    hooks: RwLock<Option<Arc<dyn LoopHooks>>>,
    events: EventLog,
    executed_loops: AtomicUsize,
}

/// Per-run state
struct RunState {
    task_id: String,
    messages: Vec<Message>,
    tool_calls: usize,
    last_text: Option<String>,
    started: Instant,
    client: Arc<dyn LlmClient>,
    hooks: Option<Arc<dyn LoopHooks>>,
}

enum TurnOutcome {
    Continue,
    Final(String),
}

impl LoopAgent {
    pub fn builder() -> LoopAgentBuilder {
        LoopAgentBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_loops(&self) -> usize {
        self.inner.max_loops
    }
}

impl LoopAgentInner {
    fn client(&self) -> Arc<dyn LlmClient> {
        match self.client.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    fn hooks(&self) -> Option<Arc<dyn LoopHooks>> {
        match self.hooks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn begin(&self, input: &AgentInput) -> RunState {
        self.events.clear();
        self.executed_loops.store(0, Ordering::SeqCst);

        let task_id = uuid::Uuid::new_v4().to_string();
        let mut messages = Vec::new();
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(Message::system(system_prompt.clone()));
        }
        let user_content = if input.context.is_null() {
            input.prompt.clone()
        } else {
            format!("{}\n\nContext:\n{}", input.prompt, input.context)
        };
        messages.push(Message::user(user_content));

        self.events.emit(
            0,
            AgentEvent::TaskStarted {
                task_id: task_id.clone(),
                agent_name: self.name.clone(),
                prompt: input.prompt.clone(),
            },
        );
        tracing::info!(agent = %self.name, task_id = %task_id, "Task started");

        RunState {
            task_id,
            messages,
            tool_calls: 0,
            last_text: None,
            started: Instant::now(),
            client: self.client(),
            hooks: self.hooks(),
        }
    }

    /// Emit the turn start and build the request, running the request hook
    async fn start_turn(&self, state: &mut RunState, loop_index: usize) -> Result<LlmRequest> {
        self.executed_loops.store(loop_index + 1, Ordering::SeqCst);
        self.events.emit(
            loop_index,
            AgentEvent::TurnStarted {
                task_id: state.task_id.clone(),
                turn_index: loop_index,
            },
        );
        tracing::debug!(turn = loop_index, "Starting turn");

        let request = LlmRequest {
            model: self.model.clone(),
            messages: state.messages.clone(),
            tools: self.tools.iter().map(|t| t.spec()).collect(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stop_sequences: Vec::new(),
            metadata: json!({
                "agent": self.name,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        };

        if let Some(hooks) = &state.hooks {
            hooks.before_llm_request(loop_index, &request).await?;
        }
        Ok(request)
    }

    /// Record the response and run any requested tools
    async fn finish_turn(
        &self,
        state: &mut RunState,
        loop_index: usize,
        response: LlmResponse,
    ) -> Result<TurnOutcome> {
        let text = response.content.clone().unwrap_or_default();
        if !text.is_empty() {
            state.last_text = Some(text.clone());
        }
        state
            .messages
            .push(Message::assistant(text.clone(), response.tool_calls.clone()));

        if response.is_final() {
            self.events.emit(
                loop_index,
                AgentEvent::TurnCompleted {
                    task_id: state.task_id.clone(),
                    turn_index: loop_index,
                    had_tool_calls: false,
                    is_final: true,
                },
            );
            return Ok(TurnOutcome::Final(text));
        }

        for call in &response.tool_calls {
            let record = self.execute_tool(state, loop_index, call).await;
            state.tool_calls += 1;

            if let Some(hooks) = &state.hooks {
                hooks.after_tool_call(loop_index, &record).await?;
            }

            let content = serde_json::to_string(&record.result)?;
            state.messages.push(Message::tool(call.id.clone(), content));
        }

        self.events.emit(
            loop_index,
            AgentEvent::TurnCompleted {
                task_id: state.task_id.clone(),
                turn_index: loop_index,
                had_tool_calls: true,
                is_final: false,
            },
        );
        Ok(TurnOutcome::Continue)
    }

    async fn execute_tool(
        &self,
        state: &RunState,
        loop_index: usize,
        call: &ToolCall,
    ) -> ToolCallRecord {
        self.events.emit(
            loop_index,
            AgentEvent::ToolCallStarted {
                task_id: state.task_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            },
        );

        let start_time = Instant::now();
        let outcome = match self.tools.iter().find(|t| t.name() == call.name) {
            Some(tool) => tool.call(call.arguments.clone()).await,
            None => Err(SnapshotError::Tool(format!("Tool not found: {}", call.name))),
        };
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let (result, error) = match outcome {
            Ok(value) => (value, None),
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "Tool call failed");
                (json!({"error": e.to_string()}), Some(e.to_string()))
            }
        };

        self.events.emit(
            loop_index,
            AgentEvent::ToolCallCompleted {
                task_id: state.task_id.clone(),
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                success: error.is_none(),
                duration_ms,
                error: error.clone(),
            },
        );

        ToolCallRecord {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result,
            success: error.is_none(),
            duration_ms,
        }
    }

    fn complete_task(
        &self,
        state: &RunState,
        loop_index: usize,
        response: Option<String>,
        success: bool,
    ) -> AgentEvent {
        let turns = self.executed_loops.load(Ordering::SeqCst);
        let event = AgentEvent::TaskCompleted {
            task_id: state.task_id.clone(),
            agent_name: self.name.clone(),
            success,
            response,
            turns,
            tool_calls: state.tool_calls,
            duration_ms: state.started.elapsed().as_millis() as u64,
        };
        self.events.emit(loop_index, event.clone());

        if success {
            tracing::info!(agent = %self.name, turns = turns, "Task completed");
        } else {
            tracing::warn!(
                agent = %self.name,
                max_loops = self.max_loops,
                "Loop limit reached without a final answer"
            );
        }
        event
    }

    fn last_loop_index(&self) -> usize {
        self.executed_loops.load(Ordering::SeqCst).saturating_sub(1)
    }
}

#[async_trait]
impl SnapshotAgent for LoopAgent {
    fn llm_client(&self) -> Arc<dyn LlmClient> {
        self.inner.client()
    }

    fn set_llm_client(&self, client: Arc<dyn LlmClient>) {
        match self.inner.client.write() {
            Ok(mut guard) => *guard = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
    }

    fn set_hooks(&self, hooks: Option<Arc<dyn LoopHooks>>) {
        match self.inner.hooks.write() {
            Ok(mut guard) => *guard = hooks,
            Err(poisoned) => *poisoned.into_inner() = hooks,
        }
    }

    async fn run(&self, input: AgentInput, cancel: CancellationToken) -> Result<AgentEvent> {
        let inner = &self.inner;
        let mut state = inner.begin(&input);

        for loop_index in 0..inner.max_loops {
            if cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled { loop_index });
            }

            let request = inner.start_turn(&mut state, loop_index).await?;
            let response = state.client.complete(&request).await?;
            if let Some(hooks) = &state.hooks {
                hooks.after_llm_response(loop_index, &response).await?;
            }

            if cancel.is_cancelled() {
                return Err(SnapshotError::Cancelled { loop_index });
            }

            if let TurnOutcome::Final(text) = inner.finish_turn(&mut state, loop_index, response).await? {
                return Ok(inner.complete_task(&state, loop_index, Some(text), true));
            }
        }

        let last_text = state.last_text.clone();
        Ok(inner.complete_task(&state, inner.last_loop_index(), last_text, false))
    }

    async fn run_stream(
        &self,
        input: AgentInput,
        cancel: CancellationToken,
    ) -> Result<EventStream> {
        Ok(Box::pin(event_stream(Arc::clone(&self.inner), input, cancel)))
    }

    fn events(&self) -> Vec<EventEnvelope> {
        self.inner.events.snapshot()
    }

    fn executed_loops(&self) -> usize {
        self.inner.executed_loops.load(Ordering::SeqCst)
    }
}

/// Lazy event stream driving one run of the agent
fn event_stream(
    inner: Arc<LoopAgentInner>,
    input: AgentInput,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<EventEnvelope>> + Send {
    try_stream! {
        let mut state = inner.begin(&input);
        let mut cursor = 0usize;
        let mut outcome: Option<(usize, String)> = None;

        for envelope in inner.events.since(cursor) {
            cursor = envelope.sequence + 1;
            yield envelope;
        }

        for loop_index in 0..inner.max_loops {
            if cancel.is_cancelled() {
                Err::<(), _>(SnapshotError::Cancelled { loop_index })?;
            }

            let request = inner.start_turn(&mut state, loop_index).await?;
            for envelope in inner.events.since(cursor) {
                cursor = envelope.sequence + 1;
                yield envelope;
            }

            let mut chunk_stream = state.client.stream(&request).await?;
            let mut chunks = Vec::new();
            while let Some(chunk) = chunk_stream.next().await {
                let chunk = chunk?;
                if let Some(text) = chunk.content.as_ref().filter(|t| !t.is_empty()) {
                    let envelope: EventEnvelope = inner.events.emit(
                        loop_index,
                        AgentEvent::StreamChunk {
                            task_id: state.task_id.clone(),
                            chunk: text.clone(),
                        },
                    );
                    cursor = envelope.sequence + 1;
                    yield envelope;
                }
                chunks.push(chunk);

                if cancel.is_cancelled() {
                    Err::<(), _>(SnapshotError::Cancelled { loop_index })?;
                }
            }
            drop(chunk_stream);

            if let Some(hooks) = &state.hooks {
                hooks.after_llm_stream(loop_index, &chunks).await?;
            }

            let response = LlmResponse::from_chunks(&chunks);
            let turn = inner.finish_turn(&mut state, loop_index, response).await?;
            for envelope in inner.events.since(cursor) {
                cursor = envelope.sequence + 1;
                yield envelope;
            }

            if let TurnOutcome::Final(text) = turn {
                outcome = Some((loop_index, text));
                break;
            }
        }

        match outcome {
            Some((loop_index, text)) => {
                inner.complete_task(&state, loop_index, Some(text), true);
            }
            None => {
                let last_text = state.last_text.clone();
                inner.complete_task(&state, inner.last_loop_index(), last_text, false);
            }
        }
        for envelope in inner.events.since(cursor) {
            cursor = envelope.sequence + 1;
            yield envelope;
        }
    }
}

/// Builder for [`LoopAgent`]
#[derive(Default)]
pub struct LoopAgentBuilder {
    name: Option<String>,
    system_prompt: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<usize>,
    max_loops: Option<usize>,
    tools: Vec<Arc<dyn AgentTool>>,
    client: Option<Arc<dyn LlmClient>>,
}

impl LoopAgentBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn max_loops(mut self, max_loops: usize) -> Self {
        self.max_loops = Some(max_loops);
        self
    }

    pub fn tool(mut self, tool: impl AgentTool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn llm_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<LoopAgent> {
        let client = self.client.ok_or_else(|| {
            SnapshotError::Configuration("LoopAgent requires an LLM client".to_string())
        })?;
        let max_loops = self.max_loops.unwrap_or(DEFAULT_MAX_LOOPS);
        if max_loops == 0 {
            return Err(SnapshotError::Configuration(
                "max_loops must be at least 1".to_string(),
            ));
        }

        Ok(LoopAgent {
            inner: Arc::new(LoopAgentInner {
                name: self.name.unwrap_or_else(|| "loop_agent".to_string()),
                system_prompt: self.system_prompt,
                model: self.model.unwrap_or_else(|| client.model_info().model_name),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
                max_loops,
                tools: self.tools,
                client: RwLock::new(client),
                hooks: RwLock::new(None),
                events: EventLog::new(),
                executed_loops: AtomicUsize::new(0),
            }),
        })
    }
}
