//! Transport-agnostic wire chunks. Each chunk serializes to one JSON object
//! tagged by `type`, and a generation is the ordered sequence of its chunks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ApprovalId, NodeId, ToolCallId};
use crate::tokens::Usage;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Aborted,
    Error,
    Other,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::ToolCalls => "tool-calls",
            Self::ContentFilter => "content-filter",
            Self::Aborted => "aborted",
            Self::Error => "error",
            Self::Other => "other",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WireChunk {
    #[serde(rename_all = "camelCase")]
    Start { message_id: NodeId },

    TextDelta { id: String, delta: String },

    ReasoningDelta { id: String, delta: String },

    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: ToolCallId,
        tool_name: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: Value,
    },

    #[serde(rename_all = "camelCase")]
    ToolInputError {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: Value,
        error_text: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolApprovalRequest {
        tool_call_id: ToolCallId,
        approval_id: ApprovalId,
        timeout_sec: u64,
    },

    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: ToolCallId,
        output: Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        preliminary: bool,
    },

    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: ToolCallId,
        error_text: String,
    },

    #[serde(rename_all = "camelCase")]
    ToolOutputDenied { tool_call_id: ToolCallId },

    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
        total_usage: Usage,
    },

    #[serde(rename_all = "camelCase")]
    Error { error_text: String },
}

impl WireChunk {
    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn error(error_text: impl Into<String>) -> Self {
        Self::Error {
            error_text: error_text.into(),
        }
    }

    /// `finish` and `error` end a stream; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextDelta { .. } => "text-delta",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputAvailable { .. } => "tool-input-available",
            Self::ToolInputError { .. } => "tool-input-error",
            Self::ToolApprovalRequest { .. } => "tool-approval-request",
            Self::ToolOutputAvailable { .. } => "tool-output-available",
            Self::ToolOutputError { .. } => "tool-output-error",
            Self::ToolOutputDenied { .. } => "tool-output-denied",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"type": "error", "errorText": format!("unserializable chunk: {e}")})
                .to_string()
        })
    }
}
