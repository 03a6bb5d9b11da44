use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::ids::FrameId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Master,
    Sub,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("delegation to '{name}' would reach depth {depth} (max {max})")]
pub struct DepthExceeded {
    pub name: String,
    pub depth: usize,
    pub max: usize,
}

/// One entry of a generation's call stack. Frames are immutable: `push`
/// returns a child whose path extends the parent's, so sibling branches
/// never share mutable state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub kind: FrameKind,
    pub name: String,
    pub frame_id: FrameId,
    #[serde(serialize_with = "serialize_path")]
    path: Arc<[String]>,
    pub model_ref: String,
}

impl CallFrame {
    pub fn master(name: impl Into<String>, model_ref: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: FrameKind::Master,
            path: Arc::from(vec![name.clone()]),
            name,
            frame_id: FrameId::new(),
            model_ref: model_ref.into(),
        }
    }

    /// Path length is the recursion depth; the master frame has depth 1.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.join("/")
    }

    pub fn push(
        &self,
        name: impl Into<String>,
        model_ref: impl Into<String>,
        max_depth: usize,
    ) -> Result<CallFrame, DepthExceeded> {
        let name = name.into();
        if self.path.len() >= max_depth {
            return Err(DepthExceeded {
                name,
                depth: self.path.len() + 1,
                max: max_depth,
            });
        }
        let mut path = self.path.to_vec();
        path.push(name.clone());
        Ok(CallFrame {
            kind: FrameKind::Sub,
            name,
            frame_id: FrameId::new(),
            path: Arc::from(path),
            model_ref: model_ref.into(),
        })
    }
}

fn serialize_path<S: Serializer>(path: &Arc<[String]>, s: S) -> Result<S::Ok, S::Error> {
    path.as_ref().serialize(s)
}
