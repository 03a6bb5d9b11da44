use std::time::Duration;

/// Failures reported by a model producer.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProducerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("producer unavailable: {0}")]
    Unavailable(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ProducerError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unavailable(_) => "unavailable",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}
