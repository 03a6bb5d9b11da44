//! Drives one generation per session from the user turn to a sealed
//! assistant node, streaming every chunk through the broker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use moka::sync::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use braid_core::frame::CallFrame;
use braid_core::ids::{NodeId, SessionId, SubscriberId, ToolCallId};
use braid_core::messages::{ChatTurn, NodeWrite, Part, Role};
use braid_core::producer::Producer;
use braid_core::tokens::Usage;
use braid_core::wire::{FinishReason, WireChunk};
use braid_store::MessageTree;

use crate::approval::{ApprovalGateway, Decision};
use crate::broker::{ReadHandle, StreamBroker, WriteHandle};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::{panic_message, ToolRegistry};
use crate::runner::{run_steps, LoopContext, LoopEvent, LoopOutcome, SharedParts, StepRun};
use crate::subagent::SubAgentDispatcher;

const RECENT_CAPACITY: u64 = 1_024;
const RECENT_TTL: Duration = Duration::from_secs(600);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationPhase {
    Init,
    Running,
    Finished,
    Aborted,
    Failed,
}

impl GenerationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted | Self::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationState {
    pub phase: GenerationPhase,
    pub frame_path: Vec<String>,
    pub user_message_id: NodeId,
    pub assistant_message_id: NodeId,
    pub started_at: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenerationOutcome {
    pub phase: GenerationPhase,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub error_text: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct BeginRequest {
    pub session_id: SessionId,
    /// Explicit continuation point; defaults to the rightmost leaf.
    pub parent_id: Option<NodeId>,
    pub user_message_id: Option<NodeId>,
    pub parts: Vec<Part>,
    /// Id of the initiating reader; generated when absent.
    pub subscriber_id: Option<SubscriberId>,
}

impl BeginRequest {
    pub fn text(session_id: SessionId, text: impl Into<String>) -> Self {
        Self {
            session_id,
            parts: vec![Part::text(text)],
            ..Default::default()
        }
    }
}

pub struct GenerationHandle {
    pub session_id: SessionId,
    pub user_message_id: NodeId,
    pub assistant_message_id: NodeId,
    /// Initiating reader, attached before the first chunk.
    pub stream: ReadHandle,
    pub join: JoinHandle<GenerationOutcome>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Approved,
    Denied,
}

struct ActiveGeneration {
    state: Arc<Mutex<GenerationState>>,
}

struct OrchestratorInner {
    tree: Arc<MessageTree>,
    broker: StreamBroker,
    gateway: ApprovalGateway,
    dispatcher: Arc<SubAgentDispatcher>,
    producer: Arc<dyn Producer>,
    tools: Arc<ToolRegistry>,
    config: EngineConfig,
    active: DashMap<SessionId, ActiveGeneration>,
    recent: Cache<SessionId, GenerationState>,
}

/// At most one running generation per session. Cheap to clone.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct Running {
    session_id: SessionId,
    assistant_id: NodeId,
    user_id: NodeId,
    writer: WriteHandle,
    state: Arc<Mutex<GenerationState>>,
}

impl AgentOrchestrator {
    pub fn new(
        tree: Arc<MessageTree>,
        broker: StreamBroker,
        gateway: ApprovalGateway,
        dispatcher: Arc<SubAgentDispatcher>,
        producer: Arc<dyn Producer>,
        tools: Arc<ToolRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                tree,
                broker,
                gateway,
                dispatcher,
                producer,
                tools,
                config,
                active: DashMap::new(),
                recent: Cache::builder()
                    .max_capacity(RECENT_CAPACITY)
                    .time_to_live(RECENT_TTL)
                    .build(),
            }),
        }
    }

    pub fn tree(&self) -> &Arc<MessageTree> {
        &self.inner.tree
    }

    pub fn broker(&self) -> &StreamBroker {
        &self.inner.broker
    }

    /// Persist the user turn, open the session's stream and start producing.
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub fn begin(&self, request: BeginRequest) -> Result<GenerationHandle, EngineError> {
        let session_id = request.session_id.clone();
        let user_id = request.user_message_id.clone().unwrap_or_default();
        let assistant_id = NodeId::new();
        let state = Arc::new(Mutex::new(GenerationState {
            phase: GenerationPhase::Init,
            frame_path: Vec::new(),
            user_message_id: user_id.clone(),
            assistant_message_id: assistant_id.clone(),
            started_at: Utc::now().to_rfc3339(),
        }));

        match self.inner.active.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                warn!(session_id = %session_id, "generation already running");
                return Err(EngineError::Conflict(format!(
                    "session {session_id} already has a running generation"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ActiveGeneration {
                    state: Arc::clone(&state),
                });
            }
        }

        match self.start(request, user_id, assistant_id, state) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.inner.active.remove(&session_id);
                warn!(
                    session_id = %session_id,
                    error = %e,
                    error_kind = e.kind(),
                    "generation failed to start"
                );
                Err(e)
            }
        }
    }

    fn start(
        &self,
        request: BeginRequest,
        user_id: NodeId,
        assistant_id: NodeId,
        state: Arc<Mutex<GenerationState>>,
    ) -> Result<GenerationHandle, EngineError> {
        let inner = &self.inner;
        let session_id = request.session_id;
        let parent_id = match request.parent_id {
            Some(parent) => Some(parent),
            None => inner.tree.resolve_rightmost_leaf(&session_id)?,
        };

        inner.tree.append(
            NodeWrite::new(session_id.clone(), user_id.clone(), parent_id, Role::User)
                .with_parts(request.parts),
        )?;
        inner.tree.upsert(
            NodeWrite::new(
                session_id.clone(),
                assistant_id.clone(),
                Some(user_id.clone()),
                Role::Assistant,
            )
            .with_meta("model", inner.producer.model_ref()),
        )?;

        let turns: Vec<ChatTurn> = inner
            .tree
            .load_context(&session_id, Some(&user_id))?
            .iter()
            .filter(|node| node.role != Role::Subagent)
            .map(ChatTurn::from)
            .collect();
        let frame = CallFrame::master(inner.config.master_name.clone(), inner.producer.model_ref());

        let writer = inner.broker.start(&session_id)?;
        let subscriber_id = request.subscriber_id.unwrap_or_default();
        let Some(stream) = inner.broker.subscribe(&session_id, &subscriber_id) else {
            writer.fail("stream closed before the generation started");
            return Err(EngineError::Internal("initiating subscriber could not attach".into()));
        };
        if let Err(e) = writer.append(WireChunk::Start {
            message_id: assistant_id.clone(),
        }) {
            writer.fail("stream closed before the generation started");
            return Err(e.into());
        }

        {
            let mut st = state.lock();
            st.phase = GenerationPhase::Running;
            st.frame_path = frame.path().to_vec();
        }
        info!(
            session_id = %session_id,
            user_message_id = %user_id,
            assistant_message_id = %assistant_id,
            turns = turns.len(),
            "generation started"
        );

        let run = run_steps(LoopContext {
            session_id: session_id.clone(),
            frame,
            node_id: assistant_id.clone(),
            turns,
            producer: Arc::clone(&inner.producer),
            tools: Arc::clone(&inner.tools),
            dispatcher: Arc::clone(&inner.dispatcher),
            gateway: inner.gateway.clone(),
            config: inner.config.clone(),
            cancel: writer.cancel_token(),
        });
        let running = Running {
            session_id: session_id.clone(),
            assistant_id: assistant_id.clone(),
            user_id: user_id.clone(),
            writer,
            state,
        };
        let join = tokio::spawn(drive(Arc::clone(inner), running, run));

        Ok(GenerationHandle {
            session_id,
            user_message_id: user_id,
            assistant_message_id: assistant_id,
            stream,
            join,
        })
    }

    /// Replay-then-live reader for an existing stream. `None` when nothing
    /// is resumable or the subscriber is already attached.
    pub fn attach_follower(
        &self,
        session_id: &SessionId,
        subscriber_id: &SubscriberId,
    ) -> Option<ReadHandle> {
        self.inner.broker.subscribe(session_id, subscriber_id)
    }

    pub fn attach_follower_from(
        &self,
        session_id: &SessionId,
        subscriber_id: &SubscriberId,
        offset: usize,
    ) -> Option<ReadHandle> {
        self.inner.broker.subscribe_from(session_id, subscriber_id, offset)
    }

    /// Request cooperative cancellation of the running generation.
    pub fn stop(&self, session_id: &SessionId) -> bool {
        if !self.inner.active.contains_key(session_id) {
            return false;
        }
        let stopped = self.inner.broker.abort(session_id);
        if stopped {
            info!(session_id = %session_id, "generation stop requested");
        }
        stopped
    }

    /// Deliver a human decision for an approval-gated tool call.
    pub fn ack_tool(
        &self,
        tool_call_id: &ToolCallId,
        status: AckStatus,
        output: Option<Value>,
        error_text: Option<String>,
    ) -> bool {
        let decision = match status {
            AckStatus::Approved => Decision {
                output,
                ..Decision::approved()
            },
            AckStatus::Denied => Decision::denied(error_text),
        };
        self.inner.gateway.resolve_by_tool_call(tool_call_id, decision)
    }

    pub fn state(&self, session_id: &SessionId) -> Option<GenerationState> {
        if let Some(active) = self.inner.active.get(session_id) {
            return Some(active.state.lock().clone());
        }
        self.inner.recent.get(session_id)
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.inner.active.contains_key(session_id)
    }

    /// Stop every running generation, e.g. on shutdown.
    pub fn stop_all(&self) -> usize {
        let sessions: Vec<SessionId> = self.inner.active.iter().map(|e| e.key().clone()).collect();
        sessions.iter().filter(|sid| self.inner.broker.abort(sid)).count()
    }
}

async fn drive(inner: Arc<OrchestratorInner>, running: Running, run: StepRun) -> GenerationOutcome {
    let StepRun { events, parts } = run;
    let mut total = Usage::default();
    let pumped = AssertUnwindSafe(pump(&inner, &running, &parts, events, &mut total))
        .catch_unwind()
        .await;
    let finished = match pumped {
        Ok(finished) => finished,
        Err(panic) => {
            error!(
                session_id = %running.session_id,
                panic = %panic_message(&panic),
                "generation loop panicked"
            );
            LoopOutcome::Failed {
                error_text: "Internal error: generation crashed".into(),
            }
        }
    };

    let outcome = match finished {
        LoopOutcome::Aborted => {
            let mut metadata = Map::new();
            metadata.insert("finishReason".into(), json!(FinishReason::Aborted.as_str()));
            if !persist(&inner, &running, &parts, metadata) {
                error!(
                    session_id = %running.session_id,
                    node_id = %running.assistant_id,
                    "failed to persist partial output"
                );
            }
            seal(&inner, &running);
            running.writer.finalize();
            GenerationOutcome {
                phase: GenerationPhase::Aborted,
                finish_reason: FinishReason::Aborted,
                usage: total,
                error_text: None,
            }
        }
        LoopOutcome::Failed { error_text } => {
            let mut metadata = Map::new();
            metadata.insert("finishReason".into(), json!(FinishReason::Error.as_str()));
            metadata.insert("errorText".into(), json!(error_text));
            if !persist(&inner, &running, &parts, metadata) {
                error!(
                    session_id = %running.session_id,
                    node_id = %running.assistant_id,
                    "failed to persist partial output"
                );
            }
            seal(&inner, &running);
            running.writer.fail(error_text.clone());
            GenerationOutcome {
                phase: GenerationPhase::Failed,
                finish_reason: FinishReason::Error,
                usage: total,
                error_text: Some(error_text),
            }
        }
        other => {
            let finish_reason = match other {
                LoopOutcome::Completed { finish_reason } => finish_reason,
                _ => FinishReason::Other,
            };
            let mut metadata = Map::new();
            metadata.insert("finishReason".into(), json!(finish_reason.as_str()));
            if !persist(&inner, &running, &parts, metadata) {
                error!(
                    session_id = %running.session_id,
                    node_id = %running.assistant_id,
                    "failed to persist final output"
                );
            }
            seal(&inner, &running);
            if let Err(e) = running.writer.append(WireChunk::Finish {
                finish_reason,
                total_usage: total,
            }) {
                debug!(session_id = %running.session_id, error = %e, "finish chunk not buffered");
            }
            running.writer.finalize();
            GenerationOutcome {
                phase: GenerationPhase::Finished,
                finish_reason,
                usage: total,
                error_text: None,
            }
        }
    };

    let final_state = {
        let mut st = running.state.lock();
        st.phase = outcome.phase;
        st.clone()
    };
    inner.recent.insert(running.session_id.clone(), final_state);
    inner.active.remove(&running.session_id);
    info!(
        session_id = %running.session_id,
        assistant_message_id = %running.assistant_id,
        phase = ?outcome.phase,
        total_tokens = total.total_tokens,
        "generation ended"
    );
    outcome
}

/// Forward loop events to the stream, flushing the assistant node as they come.
async fn pump(
    inner: &OrchestratorInner,
    running: &Running,
    parts: &SharedParts,
    mut events: BoxStream<'static, LoopEvent>,
    total: &mut Usage,
) -> LoopOutcome {
    let flush_interval = inner.config.flush_interval;
    let mut last_flush = Instant::now();

    while let Some(event) = events.next().await {
        match event {
            LoopEvent::Chunk(chunk) => {
                if let Err(e) = running.writer.append(chunk) {
                    debug!(session_id = %running.session_id, error = %e, "chunk not buffered");
                }
                if last_flush.elapsed() >= flush_interval {
                    persist(inner, running, parts, Map::new());
                    last_flush = Instant::now();
                }
            }
            LoopEvent::StepFinished { usage, elapsed, step } => {
                total.add(&usage);
                let mut metadata = usage.to_metadata();
                metadata.insert("elapsedMs".into(), json!(elapsed.as_millis() as u64));
                metadata.insert("stepCount".into(), json!(1));
                persist(inner, running, parts, metadata);
                last_flush = Instant::now();
                debug!(
                    session_id = %running.session_id,
                    step,
                    total_tokens = usage.total_tokens,
                    "step persisted"
                );
            }
            LoopEvent::Finished(outcome) => return outcome,
        }
    }
    LoopOutcome::Aborted
}

/// Upsert the assistant node with the current parts. Returns false on failure.
fn persist(
    inner: &OrchestratorInner,
    running: &Running,
    parts: &SharedParts,
    metadata: Map<String, Value>,
) -> bool {
    let write = NodeWrite::new(
        running.session_id.clone(),
        running.assistant_id.clone(),
        Some(running.user_id.clone()),
        Role::Assistant,
    )
    .with_parts(parts.snapshot())
    .with_metadata(metadata);
    match inner.tree.upsert(write) {
        Ok(_) => true,
        Err(e) => {
            warn!(
                session_id = %running.session_id,
                node_id = %running.assistant_id,
                error = %e,
                "assistant upsert failed"
            );
            false
        }
    }
}

fn seal(inner: &OrchestratorInner, running: &Running) {
    if let Err(e) = inner.tree.seal(&running.session_id, &running.assistant_id) {
        error!(
            session_id = %running.session_id,
            node_id = %running.assistant_id,
            error = %e,
            "failed to seal assistant node"
        );
    }
}
