//! `GET /events`: the event stream over Server-Sent Events.
//!
//! The receiver id arrives in the `x-receiver-id` header, set by upstream
//! identity middleware and trusted as-is. A reconnecting client sends its
//! last-seen id as `Last-Event-ID` (browsers do this automatically) or as the
//! `lastEventId` query parameter.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use herald_core::{Event, EventId, ReceiverId};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::metrics::CONNECTIONS_REJECTED_TOTAL;
use crate::server::AppState;

/// Header carrying the trusted receiver id.
pub const RECEIVER_ID_HEADER: &str = "x-receiver-id";
/// Standard SSE reconnect header.
pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Query parameters of `GET /events`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    /// Last event id the client saw.
    pub last_event_id: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// Client-visible frame: `id`, `event` and `data` lines.
///
/// Fields that would break SSE framing are left out rather than sent.
pub fn to_sse(event: &Event) -> SseEvent {
    let framed = |s: &str| !s.contains(['\n', '\r', '\0']);
    let mut frame = SseEvent::default().data(event.data_json());
    if framed(event.id.as_str()) {
        frame = frame.id(event.id.as_str());
    }
    if framed(&event.name) {
        frame = frame.event(&event.name);
    }
    frame
}

/// GET /events
pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(receiver_id) = header_value(&headers, RECEIVER_ID_HEADER) else {
        return (StatusCode::UNAUTHORIZED, "missing receiver identity").into_response();
    };

    let open = state.delivery.registry().connection_count();
    if open >= state.max_connections {
        metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
        warn!(%receiver_id, open, limit = state.max_connections, "connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let last_event_id = header_value(&headers, LAST_EVENT_ID_HEADER)
        .or(query.last_event_id.filter(|id| !id.trim().is_empty()))
        .map(EventId::from);

    debug!(%receiver_id, ?last_event_id, "event stream requested");
    let stream = state
        .delivery
        .connect(ReceiverId::from(receiver_id), last_event_id);

    // end open streams on shutdown so the listener can drain
    let frames = stream
        .take_until(state.shutdown.clone().cancelled_owned())
        .map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Sse::new(frames).into_response()
}
