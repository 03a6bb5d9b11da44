use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::ProducerError;
use crate::ids::{ApprovalId, ToolCallId};
use crate::producer::{FragmentStream, GenerationRequest, Producer};
use crate::stream::Fragment;
use crate::tokens::Usage;
use crate::wire::FinishReason;

/// Pre-programmed producer responses for deterministic tests.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield a sequence of fragments.
    Stream(Vec<Fragment>),
    /// Yield fragments with a pause before every fragment after the first.
    Paced(Vec<Fragment>, Duration),
    /// Yield fragments, then never finish.
    Hang(Vec<Fragment>),
    /// Return an error from the stream() call itself.
    Error(ProducerError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A single text block followed by `finish`.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            Fragment::text("t0", text),
            Fragment::finish(FinishReason::Stop, Usage::new(10, 5)),
        ])
    }

    /// One text delta per chunk, paced by `gap`.
    pub fn text_chunks(chunks: &[&str], gap: Duration) -> Self {
        let mut fragments: Vec<Fragment> =
            chunks.iter().map(|c| Fragment::text("t0", *c)).collect();
        fragments.push(Fragment::finish(FinishReason::Stop, Usage::new(10, 5)));
        Self::Paced(fragments, gap)
    }

    /// Some text, then a mid-stream error.
    pub fn stream_error(partial: &str, message: &str) -> Self {
        Self::Stream(vec![
            Fragment::text("t0", partial),
            Fragment::Error {
                message: message.to_string(),
            },
        ])
    }

    /// A step that ends by calling one tool.
    pub fn tool_call(tool_call_id: &str, tool_name: &str, input: Value) -> Self {
        Self::Stream(vec![
            Fragment::ToolInputStart {
                tool_call_id: ToolCallId::from_raw(tool_call_id),
                tool_name: tool_name.to_string(),
            },
            Fragment::ToolCall {
                tool_call_id: ToolCallId::from_raw(tool_call_id),
                tool_name: tool_name.to_string(),
                input,
            },
            Fragment::finish(FinishReason::ToolCalls, Usage::new(10, 5)),
        ])
    }

    /// A step that stops on an approval-gated tool call.
    pub fn approval_request(tool_call_id: &str, tool_name: &str, approval_id: &str) -> Self {
        Self::Stream(vec![
            Fragment::ApprovalRequest {
                tool_call_id: ToolCallId::from_raw(tool_call_id),
                tool_name: tool_name.to_string(),
                approval_id: ApprovalId::from_raw(approval_id),
                timeout_ms: None,
            },
            Fragment::finish(FinishReason::ToolCalls, Usage::new(10, 5)),
        ])
    }

    /// Convenience: wrap any response with a delay.
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Producer that returns pre-programmed responses in sequence and records
/// every request it receives.
pub struct MockProducer {
    model_ref: String,
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockProducer {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self::with_model("mock-model", responses)
    }

    pub fn with_model(model_ref: &str, responses: Vec<MockResponse>) -> Self {
        Self {
            model_ref: model_ref.to_string(),
            responses,
            call_count: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Producer for MockProducer {
    fn model_ref(&self) -> &str {
        &self.model_ref
    }

    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProducerError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        let response = self.responses.get(idx).cloned().ok_or_else(|| {
            ProducerError::InvalidRequest(format!(
                "MockProducer: no response configured for call {idx}"
            ))
        })?;

        resolve_response(response).await
    }
}

/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<FragmentStream, ProducerError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(fragments) => return Ok(Box::pin(stream::iter(fragments))),
            MockResponse::Paced(fragments, gap) => {
                let paced =
                    stream::iter(fragments.into_iter().enumerate()).then(move |(i, f)| async move {
                        if i > 0 {
                            tokio::time::sleep(gap).await;
                        }
                        f
                    });
                let boxed: Pin<Box<dyn Stream<Item = Fragment> + Send>> = Box::pin(paced);
                return Ok(boxed);
            }
            MockResponse::Hang(fragments) => {
                return Ok(Box::pin(stream::iter(fragments).chain(stream::pending())));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
