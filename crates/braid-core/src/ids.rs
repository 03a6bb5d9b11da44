use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "sess");
branded_id!(NodeId, "msg");
branded_id!(SubscriberId, "sub");
branded_id!(ApprovalId, "appr");
branded_id!(ToolCallId, "call");
branded_id!(FrameId, "frame");

impl NodeId {
    /// Node id of the sub-agent history record owned by a delegating tool call.
    pub fn for_subagent(tool_call_id: &ToolCallId) -> Self {
        Self(format!("subagent_{}", tool_call_id.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_prefix() {
        let id = SessionId::new();
        assert!(id.as_str().starts_with("sess_"), "got: {id}");
    }

    #[test]
    fn node_id_has_prefix() {
        let id = NodeId::new();
        assert!(id.as_str().starts_with("msg_"), "got: {id}");
    }

    #[test]
    fn approval_and_tool_call_prefixes() {
        assert!(ApprovalId::new().as_str().starts_with("appr_"));
        assert!(ToolCallId::new().as_str().starts_with("call_"));
        assert!(SubscriberId::new().as_str().starts_with("sub_"));
        assert!(FrameId::new().as_str().starts_with("frame_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = NodeId::from_raw("u1");
        assert_eq!(id.as_str(), "u1");
    }

    #[test]
    fn subagent_node_id_is_keyed_by_tool_call() {
        let call = ToolCallId::from_raw("call_42");
        assert_eq!(NodeId::for_subagent(&call).as_str(), "subagent_call_42");
        assert_eq!(NodeId::for_subagent(&call), NodeId::for_subagent(&call));
    }
}
