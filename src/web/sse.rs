//! Server-sent event stream of statuses and pings.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::handlers::{db_error_response, StatusParams};
use super::AppState;
use crate::db::{DurableStore, PingQuery};
use crate::hub::{Event, Subscriber, SubscriptionFilter};

/// Backlog pings sent when the client gives no limit.
pub const DEFAULT_BACKLOG_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct StreamParams {
    pub status: Option<String>,
    pub server_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
}

/// Stream the current statuses and recent pings, then live updates.
///
/// The subscription is registered before the backlog is read, so a check
/// finishing in between shows up at least once.
pub async fn handle_stream(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let status_query = StatusParams {
        status: params.status,
        server_id: params.server_id,
        since: params.since,
    }
    .to_query();
    let status_query = match status_query {
        Ok(q) => q,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    let subscriber = state.hub.subscribe(SubscriptionFilter::new(
        status_query.server_ids.clone(),
        None,
        status_query.status,
    ));

    let statuses = match state.store.query_statuses(&status_query) {
        Ok(s) => s,
        Err(e) => return db_error_response(e),
    };
    let pings = match state.store.query_pings(&PingQuery {
        server_ids: status_query.server_ids.clone(),
        status: None,
        since: status_query.since,
        limit: Some(params.limit.unwrap_or(DEFAULT_BACKLOG_LIMIT)),
    }) {
        Ok(p) => p,
        Err(e) => return db_error_response(e),
    };

    let mut backlog: Vec<SseEvent> = statuses
        .iter()
        .filter_map(|s| json_frame("status", s))
        .chain(pings.iter().filter_map(|p| json_frame("ping", p)))
        .collect();

    // The first frame tells the client how long to wait before reconnecting
    let retry = state.config.retry_hint;
    match backlog.first_mut() {
        Some(first) => *first = std::mem::take(first).retry(retry),
        None => backlog.push(SseEvent::default().retry(retry).comment("connected")),
    }

    // Ends with the server so graceful shutdown is not held open
    let closing = state.shutdown.clone();
    let stream = stream::iter(backlog)
        .chain(live_frames(subscriber))
        .take_until(async move { closing.wait().await })
        .map(Ok::<_, Infallible>);

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(state.config.heartbeat_interval)
                .text("heartbeat"),
        )
        .into_response()
}

fn live_frames(subscriber: Subscriber) -> impl Stream<Item = SseEvent> + Send + 'static {
    stream::unfold(subscriber, |sub| async move {
        let event = sub.recv().await?;
        Some((event, sub))
    })
    .flat_map(|event| stream::iter(frames_for(&event)))
}

/// Translate a hub event into SSE frames. An update becomes a `status`
/// frame followed by a `ping` frame.
pub fn frames_for(event: &Arc<Event>) -> Vec<SseEvent> {
    match event.as_ref() {
        Event::Status(s) => json_frame("status", s).into_iter().collect(),
        Event::Ping(p) => json_frame("ping", p).into_iter().collect(),
        Event::Update(u) => json_frame("status", &u.status)
            .into_iter()
            .chain(json_frame("ping", &u.ping))
            .collect(),
    }
}

fn json_frame<T: Serialize>(name: &str, value: &T) -> Option<SseEvent> {
    match SseEvent::default().event(name).json_data(value) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!("Failed to encode {} event: {}", name, e);
            None
        }
    }
}
