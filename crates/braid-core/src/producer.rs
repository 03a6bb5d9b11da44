use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;

use crate::errors::ProducerError;
use crate::frame::CallFrame;
use crate::ids::SessionId;
use crate::messages::ChatTurn;
use crate::stream::Fragment;
use crate::tools::ToolDefinition;

pub type FragmentStream = Pin<Box<dyn Stream<Item = Fragment> + Send>>;

/// Everything a producer sees for one step of a generation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRequest {
    pub session_id: SessionId,
    pub frame: CallFrame,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolDefinition>,
    /// Zero-based step index within the generation.
    pub step: u32,
}

impl GenerationRequest {
    pub fn new(session_id: SessionId, frame: CallFrame, turns: Vec<ChatTurn>) -> Self {
        Self {
            session_id,
            frame,
            turns,
            tools: Vec::new(),
            step: 0,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }
}

/// Model invocation seam. Implementations stream fragments for one step and
/// end each step with `Fragment::Finish` or `Fragment::Error`.
#[async_trait]
pub trait Producer: Send + Sync {
    fn model_ref(&self) -> &str;

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProducerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;

    #[test]
    fn request_defaults_to_first_step_without_tools() {
        let req = GenerationRequest::new(
            SessionId::new(),
            CallFrame::master("master", "m"),
            vec![ChatTurn::user_text("hi")],
        );
        assert_eq!(req.step, 0);
        assert!(req.tools.is_empty());
        assert_eq!(req.turns.len(), 1);
    }
}
