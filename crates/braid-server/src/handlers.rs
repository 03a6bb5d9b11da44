//! HTTP handlers for the generation control surface.

use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use braid_core::ids::{NodeId, SessionId, SubscriberId, ToolCallId};
use braid_core::messages::{MessageNode, Part};
use braid_engine::{AckStatus, BeginRequest, GenerationState, ReadHandle};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeginBody {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
    #[serde(default)]
    pub parent_message_id: Option<NodeId>,
    #[serde(default)]
    pub message_id: Option<NodeId>,
    #[serde(default)]
    pub subscriber_id: Option<SubscriberId>,
}

impl BeginBody {
    fn into_parts(
        self,
    ) -> Result<(Vec<Part>, Option<NodeId>, Option<NodeId>, Option<SubscriberId>), ApiError> {
        let mut parts = self.parts;
        if let Some(text) = self.text {
            parts.insert(0, Part::text(text));
        }
        if parts.is_empty() {
            return Err(ApiError::BadRequest("text or parts is required".into()));
        }
        Ok((parts, self.parent_message_id, self.message_id, self.subscriber_id))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub subscriber_id: Option<SubscriberId>,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckBody {
    pub status: AckStatus,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub leaf_id: Option<NodeId>,
}

#[derive(Debug, Deserialize)]
pub struct PrefaceBody {
    pub preface: Option<String>,
}

/// One SSE `data:` frame per wire chunk. Dropping the response drops the
/// read handle, which detaches the subscriber.
fn sse(handle: ReadHandle) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = handle.map(|chunk| Ok(Event::default().data(chunk.to_json())));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub async fn begin_generation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<BeginBody>,
) -> Result<Response, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let (parts, parent_id, user_message_id, subscriber_id) = body.into_parts()?;
    let handle = state.orchestrator.begin(BeginRequest {
        session_id,
        parent_id,
        user_message_id,
        parts,
        subscriber_id,
    })?;

    let headers = [
        ("x-user-message-id", handle.user_message_id.to_string()),
        ("x-assistant-message-id", handle.assistant_message_id.to_string()),
    ];
    // The generation outlives the request; its join handle is not awaited here.
    Ok((headers, sse(handle.stream)).into_response())
}

pub async fn attach_stream(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let session_id = SessionId::from_raw(session_id);
    let subscriber_id = query.subscriber_id.unwrap_or_default();
    match state
        .orchestrator
        .attach_follower_from(&session_id, &subscriber_id, query.offset)
    {
        Some(handle) => {
            info!(
                session_id = %session_id,
                subscriber_id = %subscriber_id,
                offset = query.offset,
                "follower attached"
            );
            sse(handle).into_response()
        }
        None => {
            debug!(session_id = %session_id, subscriber_id = %subscriber_id, "nothing to resume");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

pub async fn stop_generation(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<Value> {
    let stopped = state.orchestrator.stop(&SessionId::from_raw(session_id));
    Json(json!({ "stopped": stopped }))
}

pub async fn ack_tool(
    State(state): State<AppState>,
    Path(tool_call_id): Path<String>,
    Json(body): Json<AckBody>,
) -> StatusCode {
    let tool_call_id = ToolCallId::from_raw(tool_call_id);
    let delivered = state
        .orchestrator
        .ack_tool(&tool_call_id, body.status, body.output, body.error_text);
    debug!(tool_call_id = %tool_call_id, delivered, "tool ack received");
    StatusCode::NO_CONTENT
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<MessageNode>>, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let tree = state.orchestrator.tree();
    let leaf = match query.leaf_id {
        Some(leaf) => Some(leaf),
        None => tree.resolve_rightmost_leaf(&session_id)?,
    };
    Ok(Json(tree.load_context(&session_id, leaf.as_ref())?))
}

pub async fn set_preface(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PrefaceBody>,
) -> Result<StatusCode, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    let sessions = state.orchestrator.tree().sessions();
    match body.preface.as_deref().filter(|p| !p.trim().is_empty()) {
        Some(preface) => sessions.set_preface(&session_id, Some(preface))?,
        None => sessions.clear_preface(&session_id)?,
    };
    Ok(StatusCode::NO_CONTENT)
}

pub async fn generation_state(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<GenerationState>, ApiError> {
    let session_id = SessionId::from_raw(session_id);
    state
        .orchestrator
        .state(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no generation for session {session_id}")))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_body_accepts_text_or_parts() {
        let body: BeginBody =
            serde_json::from_value(json!({"text": "hi", "parentMessageId": "a1"})).unwrap();
        let (parts, parent, message_id, _) = body.into_parts().unwrap();
        assert_eq!(parts, vec![Part::text("hi")]);
        assert_eq!(parent, Some(NodeId::from_raw("a1")));
        assert!(message_id.is_none());

        let body: BeginBody = serde_json::from_value(json!({
            "parts": [{"type": "text", "text": "from parts"}]
        }))
        .unwrap();
        assert_eq!(body.into_parts().unwrap().0, vec![Part::text("from parts")]);
    }

    #[test]
    fn begin_body_without_content_is_rejected() {
        let body: BeginBody = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(body.into_parts(), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn ack_body_parses_status() {
        let body: AckBody =
            serde_json::from_value(json!({"status": "denied", "errorText": "no"})).unwrap();
        assert_eq!(body.status, AckStatus::Denied);
        assert_eq!(body.error_text.as_deref(), Some("no"));
        assert!(serde_json::from_value::<AckBody>(json!({"status": "maybe"})).is_err());
    }
}
