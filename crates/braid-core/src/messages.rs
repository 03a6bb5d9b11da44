use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{ApprovalId, NodeId, SessionId, ToolCallId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Subagent,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Subagent => "subagent",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            "subagent" => Ok(Self::Subagent),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Normal,
    CompactPrompt,
    CompactSummary,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::CompactPrompt => "compact_prompt",
            Self::CompactSummary => "compact_summary",
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(Self::Normal),
            "compact_prompt" => Ok(Self::CompactPrompt),
            "compact_summary" => Ok(Self::CompactSummary),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

/// Lifecycle of a tool invocation as rendered in a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    InputError,
    ApprovalRequested,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalVerdict {
    Approved,
    Denied,
    TimedOut,
}

/// Marker left on a tool part that needs a human decision. `verdict == None`
/// means the request is still unresolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalMarker {
    pub approval_id: ApprovalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<ApprovalVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub state: ToolState,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    /// Distinguishes infrastructure failures ("timeout") from tool-reported errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalMarker>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preliminary: bool,
}

impl ToolPart {
    pub fn new(tool_call_id: ToolCallId, tool_name: impl Into<String>) -> Self {
        Self {
            tool_call_id,
            tool_name: tool_name.into(),
            state: ToolState::InputStreaming,
            input: Value::Null,
            output: None,
            error_text: None,
            error_kind: None,
            approval: None,
            preliminary: false,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            ToolState::OutputAvailable | ToolState::OutputError | ToolState::OutputDenied
        ) && !self.preliminary
    }
}

/// One ordered content fragment of a message node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text { text: String },
    Reasoning { text: String },
    Tool(ToolPart),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Concatenated text of all text parts, in order.
pub fn text_content(parts: &[Part]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

/// A stored conversation node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageNode {
    pub id: NodeId,
    pub session_id: SessionId,
    pub parent_id: Option<NodeId>,
    pub role: Role,
    pub kind: NodeKind,
    pub parts: Vec<Part>,
    pub metadata: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
    pub sealed: bool,
}

/// Input for `append`/`upsert`. Timestamps and sealing are owned by the store.
#[derive(Clone, Debug)]
pub struct NodeWrite {
    pub id: NodeId,
    pub session_id: SessionId,
    pub parent_id: Option<NodeId>,
    pub role: Role,
    pub kind: NodeKind,
    pub parts: Vec<Part>,
    pub metadata: Map<String, Value>,
}

impl NodeWrite {
    pub fn new(session_id: SessionId, id: NodeId, parent_id: Option<NodeId>, role: Role) -> Self {
        Self {
            id,
            session_id,
            parent_id,
            role,
            kind: NodeKind::Normal,
            parts: Vec::new(),
            metadata: Map::new(),
        }
    }

    pub fn user_text(
        session_id: SessionId,
        id: NodeId,
        parent_id: Option<NodeId>,
        text: impl Into<String>,
    ) -> Self {
        Self::new(session_id, id, parent_id, Role::User).with_parts(vec![Part::text(text)])
    }

    pub fn with_parts(mut self, parts: Vec<Part>) -> Self {
        self.parts = parts;
        self
    }

    pub fn with_kind(mut self, kind: NodeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// A turn of conversation context handed to a producer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl ChatTurn {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn assistant(parts: Vec<Part>) -> Self {
        Self {
            role: Role::Assistant,
            parts,
        }
    }
}

impl From<&MessageNode> for ChatTurn {
    fn from(node: &MessageNode) -> Self {
        Self {
            role: node.role,
            parts: node.parts.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BlockKind {
    Text,
    Reasoning,
}

/// Folds streamed fragments into an ordered part list. Deltas sharing a block
/// id are concatenated; tool fragments are upserted by tool call id.
#[derive(Clone, Debug, Default)]
pub struct PartsAccumulator {
    parts: Vec<Part>,
    open_block: Option<(BlockKind, String, usize)>,
}

impl PartsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume from previously produced parts (e.g. after an approval re-run).
    pub fn from_parts(parts: Vec<Part>) -> Self {
        Self {
            parts,
            open_block: None,
        }
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn snapshot(&self) -> Vec<Part> {
        self.parts.clone()
    }

    pub fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn text_delta(&mut self, block_id: &str, delta: &str) {
        self.block_delta(BlockKind::Text, block_id, delta);
    }

    pub fn reasoning_delta(&mut self, block_id: &str, delta: &str) {
        self.block_delta(BlockKind::Reasoning, block_id, delta);
    }

    fn block_delta(&mut self, kind: BlockKind, block_id: &str, delta: &str) {
        if let Some((open_kind, open_id, idx)) = &self.open_block {
            if *open_kind == kind && open_id == block_id {
                match self.parts.get_mut(*idx) {
                    Some(Part::Text { text }) | Some(Part::Reasoning { text }) => {
                        text.push_str(delta);
                        return;
                    }
                    _ => {}
                }
            }
        }
        let part = match kind {
            BlockKind::Text => Part::Text { text: delta.to_string() },
            BlockKind::Reasoning => Part::Reasoning { text: delta.to_string() },
        };
        self.parts.push(part);
        self.open_block = Some((kind, block_id.to_string(), self.parts.len() - 1));
    }

    /// Insert or update the tool part for `tool_call_id` in place.
    pub fn upsert_tool<F>(&mut self, tool_call_id: &ToolCallId, tool_name: &str, update: F)
    where
        F: FnOnce(&mut ToolPart),
    {
        self.open_block = None;
        let position = self
            .parts
            .iter()
            .position(|p| matches!(p, Part::Tool(t) if &t.tool_call_id == tool_call_id));
        match position {
            Some(idx) => {
                if let Part::Tool(part) = &mut self.parts[idx] {
                    update(part);
                }
            }
            None => {
                let mut part = ToolPart::new(tool_call_id.clone(), tool_name);
                update(&mut part);
                self.parts.push(Part::Tool(part));
            }
        }
    }

    pub fn tool(&self, tool_call_id: &ToolCallId) -> Option<&ToolPart> {
        self.parts.iter().find_map(|p| match p {
            Part::Tool(t) if &t.tool_call_id == tool_call_id => Some(t),
            _ => None,
        })
    }

    /// Tool parts carrying an approval marker with no verdict yet.
    pub fn unresolved_approvals(&self) -> Vec<(ToolCallId, ApprovalId)> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Tool(ToolPart {
                    tool_call_id,
                    approval: Some(marker),
                    ..
                }) if marker.verdict.is_none() => {
                    Some((tool_call_id.clone(), marker.approval_id.clone()))
                }
                _ => None,
            })
            .collect()
    }
}
