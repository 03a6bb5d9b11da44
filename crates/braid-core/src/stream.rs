use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ApprovalId, ToolCallId};
use crate::tokens::Usage;
use crate::wire::FinishReason;

/// Fragments yielded by a producer during one step. Ordering contract:
///
/// (TextDelta | ReasoningDelta | ToolInputStart | ToolCall | ToolInputError |
///  ApprovalRequest)* → Finish
///
/// Error may appear at any point and ends the step.
///
/// On the wire each fragment is one JSON object tagged by `type`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Fragment {
    TextDelta {
        id: String,
        delta: String,
    },
    ReasoningDelta {
        id: String,
        delta: String,
    },
    ToolInputStart {
        tool_call_id: ToolCallId,
        tool_name: String,
    },
    /// Complete tool input; the orchestrator executes it after the step.
    ToolCall {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: Value,
    },
    ToolInputError {
        tool_call_id: ToolCallId,
        tool_name: String,
        input: Value,
        error_text: String,
    },
    /// The producer wants a human decision before `tool_call_id` proceeds.
    ApprovalRequest {
        tool_call_id: ToolCallId,
        tool_name: String,
        approval_id: ApprovalId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Finish {
        finish_reason: FinishReason,
        #[serde(default)]
        usage: Usage,
    },
    Error {
        message: String,
    },
}

impl Fragment {
    pub fn text(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
        }
    }

    pub fn finish(finish_reason: FinishReason, usage: Usage) -> Self {
        Self::Finish {
            finish_reason,
            usage,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(Fragment::finish(FinishReason::Stop, Usage::default()).is_terminal());
        assert!(Fragment::Error { message: "x".into() }.is_terminal());
        assert!(!Fragment::text("t0", "a").is_terminal());
    }

    #[test]
    fn parses_upstream_lines() {
        let f: Fragment = serde_json::from_str(
            r#"{"type":"tool-call","toolCallId":"c1","toolName":"delegate","input":{"agent":"r"}}"#,
        )
        .unwrap();
        assert!(matches!(f, Fragment::ToolCall { ref tool_name, .. } if tool_name == "delegate"));

        let f: Fragment =
            serde_json::from_str(r#"{"type":"finish","finishReason":"stop"}"#).unwrap();
        assert_eq!(f, Fragment::finish(FinishReason::Stop, Usage::default()));
    }
}
