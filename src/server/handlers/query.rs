use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::stream;

use crate::core::cancel::CancelSignal;
use crate::core::errors::ApiError;
use crate::engine::{QueryEvent, QueryRequest};
use crate::state::AppState;

/// Cancels the query if the handler future is dropped (client went away).
struct CancelOnDrop {
    signal: CancelSignal,
    armed: bool,
}

impl CancelOnDrop {
    fn new(signal: CancelSignal) -> Self {
        Self {
            signal,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.signal.cancel();
        }
    }
}

pub async fn query(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let cancel = CancelSignal::new();

    // Run detached so a disconnect still lets the query record its
    // cancellation instead of being dropped mid-flight. Once an event
    // stream is handed back, the engine watches the consumer itself.
    let mut guard = CancelOnDrop::new(cancel.clone());
    let engine = state.engine.clone();

    if request.stream {
        let handle = tokio::spawn(async move { engine.query_stream(&request, cancel).await });
        let events = handle.await.map_err(ApiError::internal)?;
        guard.disarm();
        return Ok(sse_response(events?).into_response());
    }

    let handle = tokio::spawn(async move { engine.query(&request, &cancel).await });
    let outcome = handle.await.map_err(ApiError::internal)?;
    guard.disarm();

    Ok(Json(outcome?).into_response())
}

fn sse_response(
    events: tokio::sync::mpsc::Receiver<QueryEvent>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold(events, |mut events| async move {
        let event = events.recv().await?;
        Some((Ok(to_sse_event(&event)), events))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse_event(event: &QueryEvent) -> Event {
    let name = match event {
        QueryEvent::Chunk { .. } => "chunk",
        QueryEvent::Done(_) => "done",
        QueryEvent::Error { .. } => "error",
    };
    match Event::default().event(name).json_data(event) {
        Ok(event) => event,
        Err(err) => {
            tracing::error!("Failed to encode {} event: {}", name, err);
            Event::default()
                .event("error")
                .data(r#"{"type":"error","error":{"kind":"GenerationFailed","message":"encoding failure"}}"#)
        }
    }
}
