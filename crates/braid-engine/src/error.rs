use std::time::Duration;

use braid_core::errors::ProducerError;
use braid_core::frame::DepthExceeded;
use braid_core::ids::{ApprovalId, SessionId};
use braid_core::tools::ToolError;
use braid_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("a stream is already active for session {0}")]
    Conflict(SessionId),

    #[error("no stream for session {0}")]
    NotFound(SessionId),

    #[error("stream for session {0} no longer accepts chunks")]
    Closed(SessionId),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("producer error: {0}")]
    Producer(#[from] ProducerError),

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported agent: {0}")]
    UnsupportedAgent(String),

    #[error(transparent)]
    DepthExceeded(#[from] DepthExceeded),

    #[error("approval {0} timed out")]
    ApprovalTimeout(ApprovalId),

    #[error("approval {0} denied")]
    ApprovalDenied(ApprovalId),

    #[error("tool {tool} timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("generation aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Stable snake_case classification for logs and HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Conflict(_))
            | Self::Broker(BrokerError::Conflict(_))
            | Self::Conflict(_) => "conflict",
            Self::Store(StoreError::NotFound(_))
            | Self::Broker(BrokerError::NotFound(_))
            | Self::NotFound(_) => "not_found",
            Self::Store(_) => "store",
            Self::Producer(_) => "producer",
            Self::Tool(ToolError::Timeout(_)) | Self::ToolTimeout { .. } => "tool_timeout",
            Self::Tool(_) => "tool",
            Self::Broker(_) => "broker",
            Self::UnsupportedAgent(_) => "unsupported_agent",
            Self::DepthExceeded(_) => "depth_exceeded",
            Self::ApprovalTimeout(_) => "approval_timeout",
            Self::ApprovalDenied(_) => "approval_denied",
            Self::Aborted => "aborted",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_classify_the_same_from_every_layer() {
        let sid = SessionId::from_raw("S1");
        assert_eq!(EngineError::from(StoreError::Conflict("dup".into())).kind(), "conflict");
        assert_eq!(EngineError::from(BrokerError::Conflict(sid)).kind(), "conflict");
        assert_eq!(EngineError::Conflict("busy".into()).kind(), "conflict");
    }

    #[test]
    fn policy_violations_have_distinct_kinds() {
        let depth = DepthExceeded {
            name: "deep".into(),
            depth: 5,
            max: 4,
        };
        assert_eq!(EngineError::from(depth).kind(), "depth_exceeded");
        assert_eq!(EngineError::UnsupportedAgent("x".into()).kind(), "unsupported_agent");
        assert_eq!(
            EngineError::from(ToolError::Timeout(Duration::from_secs(1))).kind(),
            "tool_timeout"
        );
    }

    #[test]
    fn depth_error_message_is_transparent() {
        let err = EngineError::from(DepthExceeded {
            name: "deep".into(),
            depth: 5,
            max: 4,
        });
        assert_eq!(err.to_string(), "delegation to 'deep' would reach depth 5 (max 4)");
    }
}
