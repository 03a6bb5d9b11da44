//! Recursive delegation to named sub-agents.
//!
//! The set of sub-agents is closed and built at startup. Each delegation
//! runs the shared step loop under a child call frame and reports back as
//! full-state snapshots, so a consumer that misses one still converges.
//! Every outcome, rejections included, is recorded as a `subagent` node
//! keyed by the delegating tool call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use braid_core::frame::CallFrame;
use braid_core::ids::{ApprovalId, NodeId, SessionId, ToolCallId};
use braid_core::messages::{ChatTurn, NodeWrite, Part, Role};
use braid_core::producer::Producer;
use braid_core::tokens::Usage;
use braid_core::tools::ToolDefinition;
use braid_core::wire::WireChunk;
use braid_store::MessageTree;

use crate::approval::ApprovalGateway;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::registry::ToolRegistry;
use crate::runner::{run_steps, LoopContext, LoopEvent, LoopOutcome, StepRun, DELEGATE_TOOL};

/// A delegation target.
pub struct SubAgentSpec {
    pub name: String,
    pub description: String,
    pub producer: Arc<dyn Producer>,
    pub tools: Arc<ToolRegistry>,
}

/// Allow-list of sub-agents, keyed by name.
#[derive(Default)]
pub struct SubAgentRegistry {
    agents: BTreeMap<String, Arc<SubAgentSpec>>,
}

impl SubAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: SubAgentSpec) {
        self.agents.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SubAgentSpec>> {
        self.agents.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubAgentStatus {
    Completed,
    Failed,
    Rejected,
    Denied,
    TimedOut,
    Aborted,
}

impl SubAgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
            Self::Denied => "denied",
            Self::TimedOut => "timed_out",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SubAgentOutcome {
    pub status: SubAgentStatus,
    pub parts: Vec<Part>,
    pub error_text: Option<String>,
    pub error_kind: Option<String>,
    pub usage: Usage,
}

impl SubAgentOutcome {
    fn from_error(
        status: SubAgentStatus,
        err: &EngineError,
        parts: Vec<Part>,
        usage: Usage,
    ) -> Self {
        Self {
            status,
            parts,
            error_text: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            usage,
        }
    }

    fn from_loop(outcome: LoopOutcome, parts: Vec<Part>, usage: Usage) -> Self {
        match outcome {
            LoopOutcome::Completed { .. } | LoopOutcome::StepLimit => Self {
                status: SubAgentStatus::Completed,
                parts,
                error_text: None,
                error_kind: None,
                usage,
            },
            LoopOutcome::Failed { error_text } => Self {
                status: SubAgentStatus::Failed,
                parts,
                error_text: Some(error_text),
                error_kind: Some("producer".to_string()),
                usage,
            },
            LoopOutcome::Denied { approval_id } => Self::from_error(
                SubAgentStatus::Denied,
                &EngineError::ApprovalDenied(approval_id),
                parts,
                usage,
            ),
            LoopOutcome::TimedOut { approval_id } => Self::from_error(
                SubAgentStatus::TimedOut,
                &EngineError::ApprovalTimeout(approval_id),
                parts,
                usage,
            ),
            LoopOutcome::Aborted => {
                Self::from_error(SubAgentStatus::Aborted, &EngineError::Aborted, parts, usage)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Progress {
    /// The sub-agent's full part list so far.
    Snapshot(Vec<Part>),
    /// A nested tool call is waiting on a human decision.
    ApprovalRequested {
        tool_call_id: ToolCallId,
        approval_id: ApprovalId,
        timeout_sec: u64,
    },
    /// Always the last item.
    Finished(SubAgentOutcome),
}

pub struct SubAgentCall {
    pub session_id: SessionId,
    pub parent_frame: CallFrame,
    pub parent_node_id: NodeId,
    pub tool_call_id: ToolCallId,
    pub agent: String,
    pub task: String,
    pub cancel: CancellationToken,
}

pub struct SubAgentDispatcher {
    registry: SubAgentRegistry,
    tree: Arc<MessageTree>,
    gateway: ApprovalGateway,
    config: EngineConfig,
}

impl SubAgentDispatcher {
    pub fn new(
        registry: SubAgentRegistry,
        tree: Arc<MessageTree>,
        gateway: ApprovalGateway,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            tree,
            gateway,
            config,
        }
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Check policy and build the child frame. Unknown agents and frames
    /// already at the depth limit are rejected.
    pub fn validate(
        &self,
        parent_frame: &CallFrame,
        agent: &str,
    ) -> Result<CallFrame, EngineError> {
        self.resolve(parent_frame, agent).map(|(frame, _)| frame)
    }

    fn resolve(
        &self,
        parent_frame: &CallFrame,
        agent: &str,
    ) -> Result<(CallFrame, Arc<SubAgentSpec>), EngineError> {
        let spec = self
            .registry
            .get(agent)
            .ok_or_else(|| EngineError::UnsupportedAgent(agent.to_string()))?;
        let frame = parent_frame.push(agent, spec.producer.model_ref(), self.config.max_depth)?;
        Ok((frame, spec))
    }

    /// Definition of the `delegate` tool offered to a frame, if it can still delegate.
    pub fn delegate_definition(&self, frame: &CallFrame) -> Option<ToolDefinition> {
        if self.registry.is_empty() || frame.depth() >= self.config.max_depth {
            return None;
        }
        let listing: Vec<String> = self
            .registry
            .agents
            .values()
            .map(|a| format!("- {}: {}", a.name, a.description))
            .collect();
        Some(ToolDefinition {
            name: DELEGATE_TOOL.to_string(),
            description: format!(
                "Hand a self-contained task to a sub-agent.\n{}",
                listing.join("\n")
            ),
            parameters_schema: json!({
                "type": "object",
                "required": ["agent", "task"],
                "properties": {
                    "agent": { "type": "string", "enum": self.registry.names() },
                    "task": { "type": "string", "description": "What the sub-agent should do" }
                }
            }),
        })
    }

    pub fn run(self: &Arc<Self>, call: SubAgentCall) -> BoxStream<'static, Progress> {
        let this = Arc::clone(self);
        Box::pin(stream! {
            let node_id = NodeId::for_subagent(&call.tool_call_id);

            let (frame, spec) = match this.resolve(&call.parent_frame, &call.agent) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(
                        session_id = %call.session_id,
                        agent = %call.agent,
                        parent = %call.parent_frame.path_string(),
                        error_kind = e.kind(),
                        "delegation rejected"
                    );
                    let outcome = SubAgentOutcome::from_error(
                        SubAgentStatus::Rejected,
                        &e,
                        Vec::new(),
                        Usage::default(),
                    );
                    let frame_path = format!("{}/{}", call.parent_frame.path_string(), call.agent);
                    this.persist_final(&call, &node_id, &frame_path, &outcome);
                    yield Progress::Finished(outcome);
                    return;
                }
            };
            let frame_path = frame.path_string();
            info!(
                session_id = %call.session_id,
                tool_call_id = %call.tool_call_id,
                frame = %frame_path,
                "delegation started"
            );

            let start = this
                .base_write(&call, &node_id, &frame_path)
                .with_meta("status", "running");
            if let Err(e) = this.tree.upsert(start) {
                error!(
                    session_id = %call.session_id,
                    node_id = %node_id,
                    error = %e,
                    "failed to record sub-agent start"
                );
                let outcome = SubAgentOutcome::from_error(
                    SubAgentStatus::Failed,
                    &EngineError::from(e),
                    Vec::new(),
                    Usage::default(),
                );
                yield Progress::Finished(outcome);
                return;
            }

            let StepRun { mut events, parts } = run_steps(LoopContext {
                session_id: call.session_id.clone(),
                frame,
                node_id: node_id.clone(),
                turns: vec![ChatTurn::user_text(call.task.clone())],
                producer: Arc::clone(&spec.producer),
                tools: Arc::clone(&spec.tools),
                dispatcher: Arc::clone(&this),
                gateway: this.gateway.clone(),
                config: this.config.clone(),
                cancel: call.cancel.clone(),
            });

            let flush_interval = this.config.flush_interval;
            let mut last_snapshot: Option<Instant> = None;
            let mut dirty = false;
            let mut total = Usage::default();
            let mut finished = LoopOutcome::Aborted;

            while let Some(event) = events.next().await {
                match event {
                    LoopEvent::Chunk(WireChunk::ToolApprovalRequest {
                        tool_call_id,
                        approval_id,
                        timeout_sec,
                    }) => {
                        dirty = false;
                        last_snapshot = Some(Instant::now());
                        yield Progress::Snapshot(parts.snapshot());
                        yield Progress::ApprovalRequested {
                            tool_call_id,
                            approval_id,
                            timeout_sec,
                        };
                    }
                    LoopEvent::Chunk(_) => {
                        dirty = true;
                        if last_snapshot.map_or(true, |t| t.elapsed() >= flush_interval) {
                            dirty = false;
                            last_snapshot = Some(Instant::now());
                            yield Progress::Snapshot(parts.snapshot());
                        }
                    }
                    LoopEvent::StepFinished { usage, elapsed, .. } => {
                        total.add(&usage);
                        let mut metadata = usage.to_metadata();
                        metadata.insert("elapsedMs".into(), json!(elapsed.as_millis() as u64));
                        metadata.insert("stepCount".into(), json!(1));
                        let mut write = this
                            .base_write(&call, &node_id, &frame_path)
                            .with_parts(parts.snapshot());
                        write.metadata.extend(metadata);
                        if let Err(e) = this.tree.upsert(write) {
                            error!(
                                session_id = %call.session_id,
                                node_id = %node_id,
                                error = %e,
                                "failed to record sub-agent step"
                            );
                        }
                    }
                    LoopEvent::Finished(outcome) => {
                        finished = outcome;
                        break;
                    }
                }
            }
            drop(events);

            if dirty {
                yield Progress::Snapshot(parts.snapshot());
            }
            let outcome = SubAgentOutcome::from_loop(finished, parts.snapshot(), total);
            this.persist_final(&call, &node_id, &frame_path, &outcome);
            info!(
                session_id = %call.session_id,
                tool_call_id = %call.tool_call_id,
                frame = %frame_path,
                status = outcome.status.as_str(),
                total_tokens = outcome.usage.total_tokens,
                "delegation ended"
            );
            yield Progress::Finished(outcome);
        })
    }

    fn base_write(&self, call: &SubAgentCall, node_id: &NodeId, frame_path: &str) -> NodeWrite {
        NodeWrite::new(
            call.session_id.clone(),
            node_id.clone(),
            Some(call.parent_node_id.clone()),
            Role::Subagent,
        )
        .with_meta("agent", call.agent.clone())
        .with_meta("task", call.task.clone())
        .with_meta("framePath", frame_path.to_string())
    }

    /// Record the terminal state and seal the node. Failures are logged;
    /// the outcome still reaches the caller.
    fn persist_final(
        &self,
        call: &SubAgentCall,
        node_id: &NodeId,
        frame_path: &str,
        outcome: &SubAgentOutcome,
    ) {
        let mut write = self
            .base_write(call, node_id, frame_path)
            .with_parts(outcome.parts.clone())
            .with_meta("status", outcome.status.as_str());
        if let Some(text) = &outcome.error_text {
            write = write.with_meta("errorText", text.clone());
        }
        if let Some(kind) = &outcome.error_kind {
            write = write.with_meta("errorKind", kind.clone());
        }
        let result = self
            .tree
            .upsert(write)
            .and_then(|_| self.tree.seal(&call.session_id, node_id));
        if let Err(e) = result {
            error!(
                session_id = %call.session_id,
                node_id = %node_id,
                error = %e,
                "failed to persist sub-agent outcome"
            );
        }
    }
}
