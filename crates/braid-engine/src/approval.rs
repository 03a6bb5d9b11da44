//! Pending human decisions for approval-gated tool calls.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::sync::Cache;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use braid_core::ids::{ApprovalId, ToolCallId};
use braid_core::messages::ApprovalVerdict;

use crate::error::EngineError;

const SETTLED_CAPACITY: u64 = 4_096;
const SETTLED_TTL: Duration = Duration::from_secs(3_600);

#[derive(Clone, Debug, PartialEq)]
pub struct Decision {
    pub verdict: ApprovalVerdict,
    pub output: Option<Value>,
    pub error_text: Option<String>,
}

impl Decision {
    pub fn approved() -> Self {
        Self {
            verdict: ApprovalVerdict::Approved,
            output: None,
            error_text: None,
        }
    }

    pub fn approved_with(output: Value) -> Self {
        Self {
            output: Some(output),
            ..Self::approved()
        }
    }

    pub fn denied(reason: Option<String>) -> Self {
        Self {
            verdict: ApprovalVerdict::Denied,
            output: None,
            error_text: reason,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            verdict: ApprovalVerdict::TimedOut,
            output: None,
            error_text: Some("approval timed out".to_string()),
        }
    }
}

struct PendingApproval {
    tool_call_id: Option<ToolCallId>,
    registered_at: Instant,
    timeout_at: Instant,
    tx: oneshot::Sender<Decision>,
    timer: AbortHandle,
}

struct GatewayInner {
    pending: DashMap<ApprovalId, PendingApproval>,
    by_tool_call: DashMap<ToolCallId, ApprovalId>,
    /// Recently settled outcomes, so duplicate or late acks can be told
    /// apart from acks for ids that never existed.
    settled: Cache<ApprovalId, ApprovalVerdict>,
    settled_calls: Cache<ToolCallId, ApprovalId>,
    default_timeout: Duration,
}

enum SettledBy {
    Ack,
    Timer,
}

/// Registry of suspended approval requests. Cheap to clone.
#[derive(Clone)]
pub struct ApprovalGateway {
    inner: Arc<GatewayInner>,
}

/// Future side of a registered approval.
pub struct PendingDecision {
    approval_id: ApprovalId,
    rx: oneshot::Receiver<Decision>,
}

impl PendingDecision {
    pub fn approval_id(&self) -> &ApprovalId {
        &self.approval_id
    }

    /// Resolves with the first of ack or timeout. A withdrawn request
    /// resolves to `Aborted`.
    pub async fn wait(self) -> Result<Decision, EngineError> {
        self.rx.await.map_err(|_| EngineError::Aborted)
    }
}

impl ApprovalGateway {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                pending: DashMap::new(),
                by_tool_call: DashMap::new(),
                settled: Cache::builder()
                    .max_capacity(SETTLED_CAPACITY)
                    .time_to_live(SETTLED_TTL)
                    .build(),
                settled_calls: Cache::builder()
                    .max_capacity(SETTLED_CAPACITY)
                    .time_to_live(SETTLED_TTL)
                    .build(),
                default_timeout,
            }),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Register a pending approval and start its timeout timer.
    pub fn register(
        &self,
        approval_id: ApprovalId,
        tool_call_id: Option<ToolCallId>,
        timeout: Option<Duration>,
    ) -> Result<PendingDecision, EngineError> {
        let timeout = timeout.unwrap_or(self.inner.default_timeout);
        let (tx, rx) = oneshot::channel();

        match self.inner.pending.entry(approval_id.clone()) {
            Entry::Occupied(_) => {
                return Err(EngineError::Conflict(format!(
                    "approval {approval_id} already pending"
                )));
            }
            Entry::Vacant(vacant) => {
                // Mapped before the timer starts; an instant timeout must find it.
                if let Some(call) = &tool_call_id {
                    self.inner.by_tool_call.insert(call.clone(), approval_id.clone());
                }
                let weak: Weak<GatewayInner> = Arc::downgrade(&self.inner);
                let timer_id = approval_id.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        settle(&inner, &timer_id, Decision::timed_out(), SettledBy::Timer);
                    }
                });
                let now = Instant::now();
                vacant.insert(PendingApproval {
                    tool_call_id,
                    registered_at: now,
                    timeout_at: now + timeout,
                    tx,
                    timer: timer.abort_handle(),
                });
            }
        }
        info!(
            approval_id = %approval_id,
            timeout_ms = timeout.as_millis() as u64,
            "approval registered"
        );
        Ok(PendingDecision { approval_id, rx })
    }

    /// Deliver a decision. Returns false, with a warning, when the id is
    /// unknown or already settled.
    pub fn resolve(&self, approval_id: &ApprovalId, decision: Decision) -> bool {
        settle(&self.inner, approval_id, decision, SettledBy::Ack)
    }

    /// Deliver a decision addressed by the gated tool call's id.
    pub fn resolve_by_tool_call(&self, tool_call_id: &ToolCallId, decision: Decision) -> bool {
        let approval_id = self.inner.by_tool_call.get(tool_call_id).map(|e| e.value().clone());
        match approval_id {
            Some(id) => settle(&self.inner, &id, decision, SettledBy::Ack),
            None => {
                match self.inner.settled_calls.get(tool_call_id) {
                    Some(id) => {
                        let outcome = self.inner.settled.get(&id);
                        warn!(
                            tool_call_id = %tool_call_id,
                            approval_id = %id,
                            ?outcome,
                            "late approval ack ignored"
                        );
                    }
                    None => warn!(
                        tool_call_id = %tool_call_id,
                        "approval ack for unknown tool call ignored"
                    ),
                }
                false
            }
        }
    }

    /// Drop a pending request without a decision; its waiter sees `Aborted`.
    pub fn withdraw(&self, approval_id: &ApprovalId) -> bool {
        match self.inner.pending.remove(approval_id) {
            Some((_, pending)) => {
                pending.timer.abort();
                if let Some(call) = &pending.tool_call_id {
                    self.inner.by_tool_call.remove(call);
                }
                debug!(approval_id = %approval_id, "approval withdrawn");
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, approval_id: &ApprovalId) -> bool {
        self.inner.pending.contains_key(approval_id)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Remaining time before a pending approval times out.
    pub fn remaining(&self, approval_id: &ApprovalId) -> Option<Duration> {
        self.inner
            .pending
            .get(approval_id)
            .map(|p| p.timeout_at.saturating_duration_since(Instant::now()))
    }
}

fn settle(
    inner: &GatewayInner,
    approval_id: &ApprovalId,
    decision: Decision,
    by: SettledBy,
) -> bool {
    let Some((_, pending)) = inner.pending.remove(approval_id) else {
        if matches!(by, SettledBy::Ack) {
            match inner.settled.get(approval_id) {
                Some(outcome) => {
                    warn!(approval_id = %approval_id, ?outcome, "late approval ack ignored")
                }
                None => warn!(approval_id = %approval_id, "approval ack for unknown id ignored"),
            }
        }
        return false;
    };

    if matches!(by, SettledBy::Ack) {
        pending.timer.abort();
    }
    if let Some(call) = &pending.tool_call_id {
        inner.by_tool_call.remove(call);
        inner.settled_calls.insert(call.clone(), approval_id.clone());
    }
    inner.settled.insert(approval_id.clone(), decision.verdict);

    let waited_ms = pending.registered_at.elapsed().as_millis() as u64;
    info!(approval_id = %approval_id, verdict = ?decision.verdict, waited_ms, "approval settled");
    if pending.tx.send(decision).is_err() {
        debug!(approval_id = %approval_id, "approval waiter already gone");
    }
    true
}
