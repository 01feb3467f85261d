use axum::{
    body::Body,
    extract::{rejection::JsonRejection, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::warn;

use crate::models::chat::{ChatRequest, CompletionResponse, ModelRequestSchema};
use crate::services::{ChatOutcome, ChatService, EventStream};
use crate::utils::error::ApiError;

pub async fn chat_completions_handler(
    State(chat_service): State<Arc<ChatService>>,
    payload: Result<Json<ModelRequestSchema>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(schema) = payload.map_err(|e| ApiError::Validation(e.body_text()))?;
    let request = ChatRequest::try_from(schema.data)?;

    match chat_service.complete(request).await? {
        ChatOutcome::Completion(response) => {
            Ok(Json(CompletionResponse { response }).into_response())
        }
        ChatOutcome::Stream(events) => stream_response(events),
    }
}

/// Newline-delimited JSON, one object per event. A failure after the first
/// event is written as a final `{"error", "message"}` line.
fn stream_response(events: EventStream) -> Result<Response, ApiError> {
    let body = events.map(|item| {
        let line = match item {
            Ok(event) => event.to_line(),
            Err(e) => {
                warn!("Stream aborted: {}", e);
                error_line(&e)
            }
        };
        Ok::<_, Infallible>(Bytes::from(line))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(body))
        .map_err(|e| ApiError::Internal(format!("Failed to build stream response: {}", e)))
}

fn error_line(error: &ApiError) -> String {
    let mut line = serde_json::to_string(&error.body()).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}
