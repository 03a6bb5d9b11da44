//! Small tools shared by engine tests.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use braid_core::frame::CallFrame;
use braid_core::ids::{SessionId, ToolCallId};
use braid_core::tools::{Tool, ToolCategory, ToolContext, ToolError};

pub fn tool_context() -> ToolContext {
    ToolContext {
        session_id: SessionId::from_raw("S1"),
        tool_call_id: ToolCallId::from_raw("c1"),
        frame: CallFrame::master("master", "mock-model"),
        abort_signal: CancellationToken::new(),
    }
}

/// Returns its input wrapped as `{"echo": input}`.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echo the input back"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Ok(json!({ "echo": args }))
    }
}

/// Sleeps far longer than any test timeout.
pub struct SlowTool {
    category: ToolCategory,
}

impl SlowTool {
    pub fn control() -> Self {
        Self {
            category: ToolCategory::Control,
        }
    }

    pub fn standard() -> Self {
        Self {
            category: ToolCategory::Standard,
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }
    fn description(&self) -> &str {
        "A tool that takes forever"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    fn category(&self) -> ToolCategory {
        self.category
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(json!("done"))
    }
}

pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }
    fn description(&self) -> &str {
        "Panics"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        panic!("tool exploded");
    }
}

pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "failing"
    }
    fn description(&self) -> &str {
        "Always reports a failure"
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object"})
    }
    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        Err(ToolError::ExecutionFailed("disk on fire".into()))
    }
}
