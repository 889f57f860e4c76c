//! /events: hive events as server-sent events.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use futures::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::ApiState;

/// Each event is named after its `type` tag and carries the event as JSON.
/// A listener that falls behind skips the events it missed.
pub async fn handle_events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.coordinator.events().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| {
        let event = item.ok()?;
        let data = serde_json::to_value(&event).ok()?;
        let name = data
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("event")
            .to_string();
        Some(Ok(Event::default().event(name).data(data.to_string())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
