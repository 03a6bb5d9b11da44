//! The producer step loop shared by master generations and sub-agent runs.
//!
//! One step is one producer call. Fragments are folded into the part list
//! and re-emitted as wire chunks; tool calls and approval gates found in a
//! step are settled before the next step, whose request carries the updated
//! parts as a new assistant turn.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use braid_core::frame::CallFrame;
use braid_core::ids::{ApprovalId, NodeId, SessionId, ToolCallId};
use braid_core::messages::{
    ApprovalMarker, ApprovalVerdict, ChatTurn, Part, PartsAccumulator, ToolState,
};
use braid_core::producer::{GenerationRequest, Producer};
use braid_core::stream::Fragment;
use braid_core::tokens::Usage;
use braid_core::tools::ToolContext;
use braid_core::wire::{FinishReason, WireChunk};

use crate::approval::{ApprovalGateway, Decision};
use crate::config::EngineConfig;
use crate::registry::ToolRegistry;
use crate::subagent::{
    Progress, SubAgentCall, SubAgentDispatcher, SubAgentOutcome, SubAgentStatus,
};

/// Reserved tool name routed to the sub-agent dispatcher.
pub const DELEGATE_TOOL: &str = "delegate";

#[derive(Clone, Debug, PartialEq)]
pub enum LoopOutcome {
    Completed { finish_reason: FinishReason },
    StepLimit,
    Denied { approval_id: ApprovalId },
    TimedOut { approval_id: ApprovalId },
    Aborted,
    Failed { error_text: String },
}

#[derive(Clone, Debug, PartialEq)]
pub enum LoopEvent {
    Chunk(WireChunk),
    StepFinished { usage: Usage, elapsed: Duration, step: u32 },
    Finished(LoopOutcome),
}

/// Part list of the turn being produced, readable while the loop runs.
#[derive(Clone, Default)]
pub struct SharedParts(Arc<Mutex<PartsAccumulator>>);

impl SharedParts {
    pub fn snapshot(&self) -> Vec<Part> {
        self.0.lock().snapshot()
    }

    pub fn len(&self) -> usize {
        self.0.lock().parts().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with<R>(&self, f: impl FnOnce(&mut PartsAccumulator) -> R) -> R {
        f(&mut self.0.lock())
    }

    fn since(&self, start: usize) -> Vec<Part> {
        self.0.lock().parts().get(start..).map(<[Part]>::to_vec).unwrap_or_default()
    }
}

pub struct LoopContext {
    pub session_id: SessionId,
    pub frame: CallFrame,
    /// Node the loop's output is written to; parent of any sub-agent nodes.
    pub node_id: NodeId,
    pub turns: Vec<ChatTurn>,
    pub producer: Arc<dyn Producer>,
    pub tools: Arc<ToolRegistry>,
    pub dispatcher: Arc<SubAgentDispatcher>,
    pub gateway: ApprovalGateway,
    pub config: EngineConfig,
    pub cancel: CancellationToken,
}

pub struct StepRun {
    pub events: BoxStream<'static, LoopEvent>,
    pub parts: SharedParts,
}

pub fn run_steps(ctx: LoopContext) -> StepRun {
    let parts = SharedParts::default();
    StepRun {
        events: step_loop(ctx, parts.clone()).boxed(),
        parts,
    }
}

#[derive(Deserialize)]
struct DelegateInput {
    agent: String,
    task: String,
}

struct PendingCall {
    tool_call_id: ToolCallId,
    tool_name: String,
    input: Value,
}

struct PendingApproval {
    tool_call_id: ToolCallId,
    approval_id: ApprovalId,
    timeout: Duration,
}

enum Next<T> {
    Cancelled,
    Item(T),
}

fn step_loop(
    ctx: LoopContext,
    parts: SharedParts,
) -> impl futures::Stream<Item = LoopEvent> + Send + 'static {
    stream! {
        let mut turns = ctx.turns.clone();
        let mut definitions = ctx.tools.definitions();
        if let Some(delegate) = ctx.dispatcher.delegate_definition(&ctx.frame) {
            definitions.push(delegate);
        }
        let frame_path = ctx.frame.path_string();

        for step in 0..ctx.config.max_steps {
            let step_start = parts.len();
            let started = Instant::now();
            let request = GenerationRequest {
                session_id: ctx.session_id.clone(),
                frame: ctx.frame.clone(),
                turns: turns.clone(),
                tools: definitions.clone(),
                step,
            };

            let opened = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => Next::Cancelled,
                r = ctx.producer.stream(&request) => Next::Item(r),
            };
            let mut fragments = match opened {
                Next::Cancelled => {
                    yield LoopEvent::Finished(LoopOutcome::Aborted);
                    return;
                }
                Next::Item(Err(e)) => {
                    warn!(
                        session_id = %ctx.session_id,
                        frame = %frame_path,
                        step,
                        error = %e,
                        error_kind = e.error_kind(),
                        "producer failed to start"
                    );
                    yield LoopEvent::Finished(LoopOutcome::Failed { error_text: e.to_string() });
                    return;
                }
                Next::Item(Ok(s)) => s,
            };

            let mut usage = Usage::default();
            let mut finish_reason = None;
            let mut failure = None;
            let mut calls: Vec<PendingCall> = Vec::new();
            let mut approvals: Vec<PendingApproval> = Vec::new();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Next::Cancelled,
                    f = fragments.next() => Next::Item(f),
                };
                let fragment = match next {
                    Next::Cancelled => {
                        yield LoopEvent::Finished(LoopOutcome::Aborted);
                        return;
                    }
                    Next::Item(None) => break,
                    Next::Item(Some(f)) => f,
                };
                match fragment {
                    Fragment::TextDelta { id, delta } => {
                        parts.with(|acc| acc.text_delta(&id, &delta));
                        yield LoopEvent::Chunk(WireChunk::TextDelta { id, delta });
                    }
                    Fragment::ReasoningDelta { id, delta } => {
                        parts.with(|acc| acc.reasoning_delta(&id, &delta));
                        yield LoopEvent::Chunk(WireChunk::ReasoningDelta { id, delta });
                    }
                    Fragment::ToolInputStart { tool_call_id, tool_name } => {
                        parts.with(|acc| {
                            acc.upsert_tool(&tool_call_id, &tool_name, |t| {
                                t.state = ToolState::InputStreaming
                            })
                        });
                        yield LoopEvent::Chunk(WireChunk::ToolInputStart {
                            tool_call_id,
                            tool_name,
                        });
                    }
                    Fragment::ToolCall { tool_call_id, tool_name, input } => {
                        parts.with(|acc| {
                            acc.upsert_tool(&tool_call_id, &tool_name, |t| {
                                t.state = ToolState::InputAvailable;
                                t.input = input.clone();
                            })
                        });
                        calls.push(PendingCall {
                            tool_call_id: tool_call_id.clone(),
                            tool_name: tool_name.clone(),
                            input: input.clone(),
                        });
                        yield LoopEvent::Chunk(WireChunk::ToolInputAvailable {
                            tool_call_id,
                            tool_name,
                            input,
                        });
                    }
                    Fragment::ToolInputError { tool_call_id, tool_name, input, error_text } => {
                        parts.with(|acc| {
                            acc.upsert_tool(&tool_call_id, &tool_name, |t| {
                                t.state = ToolState::InputError;
                                t.input = input.clone();
                                t.error_text = Some(error_text.clone());
                            })
                        });
                        yield LoopEvent::Chunk(WireChunk::ToolInputError {
                            tool_call_id,
                            tool_name,
                            input,
                            error_text,
                        });
                    }
                    Fragment::ApprovalRequest {
                        tool_call_id,
                        tool_name,
                        approval_id,
                        timeout_ms,
                    } => {
                        parts.with(|acc| {
                            acc.upsert_tool(&tool_call_id, &tool_name, |t| {
                                t.state = ToolState::ApprovalRequested;
                                t.approval = Some(ApprovalMarker {
                                    approval_id: approval_id.clone(),
                                    verdict: None,
                                    reason: None,
                                });
                            })
                        });
                        approvals.push(PendingApproval {
                            tool_call_id,
                            approval_id,
                            timeout: timeout_ms
                                .map(Duration::from_millis)
                                .unwrap_or(ctx.config.approval_timeout),
                        });
                    }
                    Fragment::Finish { finish_reason: reason, usage: step_usage } => {
                        finish_reason = Some(reason);
                        usage = step_usage;
                        break;
                    }
                    Fragment::Error { message } => {
                        failure = Some(message);
                        break;
                    }
                }
            }
            drop(fragments);

            yield LoopEvent::StepFinished { usage, elapsed: started.elapsed(), step };

            if let Some(error_text) = failure {
                warn!(
                    session_id = %ctx.session_id,
                    frame = %frame_path,
                    step,
                    error = %error_text,
                    "producer reported an error"
                );
                yield LoopEvent::Finished(LoopOutcome::Failed { error_text });
                return;
            }
            let Some(finish_reason) = finish_reason else {
                yield LoopEvent::Finished(LoopOutcome::Failed {
                    error_text: "producer stream ended without a finish".to_string(),
                });
                return;
            };
            if calls.is_empty() && approvals.is_empty() {
                debug!(
                    session_id = %ctx.session_id,
                    frame = %frame_path,
                    step,
                    "step loop completed"
                );
                yield LoopEvent::Finished(LoopOutcome::Completed { finish_reason });
                return;
            }

            for gate in approvals {
                let registered = ctx.gateway.register(
                    gate.approval_id.clone(),
                    Some(gate.tool_call_id.clone()),
                    Some(gate.timeout),
                );
                let pending = match registered {
                    Ok(p) => p,
                    Err(e) => {
                        yield LoopEvent::Finished(LoopOutcome::Failed {
                            error_text: e.to_string(),
                        });
                        return;
                    }
                };
                yield LoopEvent::Chunk(WireChunk::ToolApprovalRequest {
                    tool_call_id: gate.tool_call_id.clone(),
                    approval_id: gate.approval_id.clone(),
                    timeout_sec: gate.timeout.as_millis().div_ceil(1000) as u64,
                });

                let waited = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Next::Cancelled,
                    d = pending.wait() => Next::Item(d),
                };
                let decision = match waited {
                    Next::Cancelled => {
                        ctx.gateway.withdraw(&gate.approval_id);
                        yield LoopEvent::Finished(LoopOutcome::Aborted);
                        return;
                    }
                    Next::Item(Err(_)) => {
                        yield LoopEvent::Finished(LoopOutcome::Aborted);
                        return;
                    }
                    Next::Item(Ok(d)) => d,
                };

                let (chunk, stop) = apply_decision(&parts, &gate, decision);
                yield LoopEvent::Chunk(chunk);
                if let Some(outcome) = stop {
                    turns.push(ChatTurn::assistant(parts.since(step_start)));
                    yield LoopEvent::Finished(outcome);
                    return;
                }
            }

            for call in calls {
                if call.tool_name == DELEGATE_TOOL {
                    let input: DelegateInput = match serde_json::from_value(call.input.clone()) {
                        Ok(input) => input,
                        Err(e) => {
                            let chunk = record_failure(
                                &parts,
                                &call,
                                "invalid_arguments",
                                format!("invalid delegate input: {e}"),
                            );
                            yield LoopEvent::Chunk(chunk);
                            continue;
                        }
                    };
                    let mut progress = ctx.dispatcher.run(SubAgentCall {
                        session_id: ctx.session_id.clone(),
                        parent_frame: ctx.frame.clone(),
                        parent_node_id: ctx.node_id.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        agent: input.agent.clone(),
                        task: input.task,
                        cancel: ctx.cancel.child_token(),
                    });
                    while let Some(event) = progress.next().await {
                        match event {
                            Progress::Snapshot(sub_parts) => {
                                let output = json!({ "agent": input.agent, "parts": sub_parts });
                                parts.with(|acc| {
                                    acc.upsert_tool(&call.tool_call_id, &call.tool_name, |t| {
                                        t.state = ToolState::OutputAvailable;
                                        t.output = Some(output.clone());
                                        t.preliminary = true;
                                    })
                                });
                                yield LoopEvent::Chunk(WireChunk::ToolOutputAvailable {
                                    tool_call_id: call.tool_call_id.clone(),
                                    output,
                                    preliminary: true,
                                });
                            }
                            Progress::ApprovalRequested {
                                tool_call_id,
                                approval_id,
                                timeout_sec,
                            } => {
                                yield LoopEvent::Chunk(WireChunk::ToolApprovalRequest {
                                    tool_call_id,
                                    approval_id,
                                    timeout_sec,
                                });
                            }
                            Progress::Finished(outcome) => {
                                info!(
                                    session_id = %ctx.session_id,
                                    tool_call_id = %call.tool_call_id,
                                    agent = %input.agent,
                                    status = outcome.status.as_str(),
                                    "delegation finished"
                                );
                                let chunk = match outcome.status {
                                    SubAgentStatus::Completed => {
                                        let output =
                                            json!({ "agent": input.agent, "parts": outcome.parts });
                                        record_output(&parts, &call, output)
                                    }
                                    SubAgentStatus::Denied => {
                                        record_denied(&parts, &call, &outcome)
                                    }
                                    _ => record_failure(
                                        &parts,
                                        &call,
                                        outcome.error_kind.as_deref().unwrap_or("subagent"),
                                        outcome
                                            .error_text
                                            .clone()
                                            .unwrap_or_else(|| "sub-agent failed".to_string()),
                                    ),
                                };
                                yield LoopEvent::Chunk(chunk);
                            }
                        }
                    }
                } else {
                    let tool_ctx = ToolContext {
                        session_id: ctx.session_id.clone(),
                        tool_call_id: call.tool_call_id.clone(),
                        frame: ctx.frame.clone(),
                        abort_signal: ctx.cancel.child_token(),
                    };
                    let executed = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => Next::Cancelled,
                        o = ctx.tools.execute(
                            &call.tool_name,
                            call.input.clone(),
                            &tool_ctx,
                            &ctx.config.tools,
                        ) => Next::Item(o),
                    };
                    let outcome = match executed {
                        Next::Cancelled => {
                            yield LoopEvent::Finished(LoopOutcome::Aborted);
                            return;
                        }
                        Next::Item(o) => o,
                    };
                    debug!(
                        tool = %call.tool_name,
                        duration_ms = outcome.duration.as_millis() as u64,
                        ok = outcome.result.is_ok(),
                        "tool call settled"
                    );
                    let chunk = match outcome.result {
                        Ok(output) => record_output(&parts, &call, output),
                        Err(failure) => {
                            record_failure(&parts, &call, &failure.error_kind, failure.error_text)
                        }
                    };
                    yield LoopEvent::Chunk(chunk);
                }
            }

            if ctx.cancel.is_cancelled() {
                yield LoopEvent::Finished(LoopOutcome::Aborted);
                return;
            }
            turns.push(ChatTurn::assistant(parts.since(step_start)));
        }

        warn!(
            session_id = %ctx.session_id,
            frame = %frame_path,
            max_steps = ctx.config.max_steps,
            "step limit reached"
        );
        yield LoopEvent::Finished(LoopOutcome::StepLimit);
    }
}

/// Fold an approval decision into the gated part. Returns the chunk to
/// emit and, for denials and timeouts, the outcome that ends the loop.
fn apply_decision(
    parts: &SharedParts,
    gate: &PendingApproval,
    decision: Decision,
) -> (WireChunk, Option<LoopOutcome>) {
    let tool_call_id = gate.tool_call_id.clone();
    let verdict = decision.verdict;
    parts.with(|acc| {
        let tool_name = acc
            .tool(&tool_call_id)
            .map(|t| t.tool_name.clone())
            .unwrap_or_default();
        acc.upsert_tool(&tool_call_id, &tool_name, |t| {
            if let Some(marker) = t.approval.as_mut() {
                marker.verdict = Some(verdict);
                marker.reason = decision.error_text.clone();
            }
            match verdict {
                ApprovalVerdict::Approved => {
                    t.state = ToolState::OutputAvailable;
                    let output = decision.output.clone();
                    t.output = Some(output.unwrap_or_else(|| json!({ "approved": true })));
                }
                ApprovalVerdict::Denied => {
                    t.state = ToolState::OutputDenied;
                    t.error_text = decision.error_text.clone();
                }
                ApprovalVerdict::TimedOut => {
                    t.state = ToolState::OutputError;
                    t.error_text = Some("approval timed out".to_string());
                    t.error_kind = Some("approval_timeout".to_string());
                }
            }
        });
    });

    match verdict {
        ApprovalVerdict::Approved => {
            let output = decision.output.unwrap_or_else(|| json!({ "approved": true }));
            (
                WireChunk::ToolOutputAvailable {
                    tool_call_id,
                    output,
                    preliminary: false,
                },
                None,
            )
        }
        ApprovalVerdict::Denied => (
            WireChunk::ToolOutputDenied { tool_call_id },
            Some(LoopOutcome::Denied {
                approval_id: gate.approval_id.clone(),
            }),
        ),
        ApprovalVerdict::TimedOut => (
            WireChunk::ToolOutputError {
                tool_call_id,
                error_text: "approval timed out".to_string(),
            },
            Some(LoopOutcome::TimedOut {
                approval_id: gate.approval_id.clone(),
            }),
        ),
    }
}

fn record_output(parts: &SharedParts, call: &PendingCall, output: Value) -> WireChunk {
    parts.with(|acc| {
        acc.upsert_tool(&call.tool_call_id, &call.tool_name, |t| {
            t.state = ToolState::OutputAvailable;
            t.output = Some(output.clone());
            t.preliminary = false;
        })
    });
    WireChunk::ToolOutputAvailable {
        tool_call_id: call.tool_call_id.clone(),
        output,
        preliminary: false,
    }
}

fn record_denied(parts: &SharedParts, call: &PendingCall, outcome: &SubAgentOutcome) -> WireChunk {
    parts.with(|acc| {
        acc.upsert_tool(&call.tool_call_id, &call.tool_name, |t| {
            t.state = ToolState::OutputDenied;
            t.preliminary = false;
            t.error_text = outcome.error_text.clone();
            t.error_kind = outcome.error_kind.clone();
        })
    });
    WireChunk::ToolOutputDenied {
        tool_call_id: call.tool_call_id.clone(),
    }
}

fn record_failure(
    parts: &SharedParts,
    call: &PendingCall,
    error_kind: &str,
    error_text: String,
) -> WireChunk {
    parts.with(|acc| {
        acc.upsert_tool(&call.tool_call_id, &call.tool_name, |t| {
            t.state = ToolState::OutputError;
            t.preliminary = false;
            t.error_text = Some(error_text.clone());
            t.error_kind = Some(error_kind.to_string());
        })
    });
    WireChunk::ToolOutputError {
        tool_call_id: call.tool_call_id.clone(),
        error_text,
    }
}
