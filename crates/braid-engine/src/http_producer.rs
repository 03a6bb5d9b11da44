use std::fmt::Display;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use braid_core::errors::ProducerError;
use braid_core::producer::{FragmentStream, GenerationRequest, Producer};
use braid_core::settings::ProducerSettings;
use braid_core::stream::Fragment;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct RequestBody<'a> {
    model: &'a str,
    #[serde(flatten)]
    request: &'a GenerationRequest,
}

/// Producer backed by an upstream service that answers a POSTed
/// `GenerationRequest` with newline-delimited fragment JSON.
pub struct HttpProducer {
    client: Client,
    endpoint: String,
    model: String,
    idle_timeout: Duration,
}

impl HttpProducer {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        idle_timeout: Duration,
    ) -> Result<Self, ProducerError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProducerError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            idle_timeout,
        })
    }

    /// `None` when no endpoint is configured.
    pub fn from_settings(settings: &ProducerSettings) -> Result<Option<Self>, ProducerError> {
        match &settings.endpoint {
            Some(endpoint) => {
                Self::new(endpoint.clone(), settings.model.clone(), settings.idle_timeout())
                    .map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Producer for HttpProducer {
    fn model_ref(&self) -> &str {
        &self.model
    }

    #[instrument(
        skip(self, request),
        fields(model = %self.model, session_id = %request.session_id, step = request.step)
    )]
    async fn stream(&self, request: &GenerationRequest) -> Result<FragmentStream, ProducerError> {
        let body = RequestBody {
            model: &self.model,
            request,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .header("accept", "application/x-ndjson")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProducerError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "producer rejected request");
            return Err(status_error(status, text));
        }

        Ok(ndjson_fragments(resp.bytes_stream(), self.idle_timeout))
    }
}

fn status_error(status: StatusCode, body: String) -> ProducerError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };
    if status.is_client_error() {
        ProducerError::InvalidRequest(detail)
    } else {
        ProducerError::Unavailable(detail)
    }
}

/// Split a byte stream into one fragment per line. The stream ends after
/// the first terminal fragment, a malformed line, a transport error, or
/// when no bytes arrive within `idle_timeout`.
pub fn ndjson_fragments<S, B, E>(inner: S, idle_timeout: Duration) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
{
    Box::pin(stream! {
        let mut inner = Box::pin(inner);
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let next = match tokio::time::timeout(idle_timeout, inner.next()).await {
                Ok(next) => next,
                Err(_) => {
                    yield Fragment::Error {
                        message: format!("idle timeout after {}s", idle_timeout.as_secs()),
                    };
                    return;
                }
            };
            match next {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(bytes.as_ref());
                    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buffer.drain(..=pos).collect();
                        match parse_line(&line) {
                            Some(Ok(fragment)) => {
                                let terminal = fragment.is_terminal();
                                yield fragment;
                                if terminal {
                                    return;
                                }
                            }
                            Some(Err(error)) => {
                                yield error;
                                return;
                            }
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Fragment::Error {
                        message: format!("stream interrupted: {e}"),
                    };
                    return;
                }
                None => {
                    match parse_line(&buffer) {
                        Some(Ok(fragment)) => yield fragment,
                        Some(Err(error)) => yield error,
                        None => {}
                    }
                    debug!("producer stream closed");
                    return;
                }
            }
        }
    })
}

fn parse_line(line: &[u8]) -> Option<Result<Fragment, Fragment>> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<Fragment>(text).map_err(|e| Fragment::Error {
        message: format!("malformed fragment: {e}"),
    }))
}
