//! WebSocket adapter: on-demand snapshots and live check updates.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap},
    response::Response,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::db::{DbError, DurableStore, PingQuery, Server, StatusQuery};
use crate::hub::{Event, Subscriber, SubscriptionFilter};

/// Close code sent to clients that fail authentication.
pub const UNAUTHENTICATED_CLOSE_CODE: u16 = 4001;

/// Close code sent when the server shuts down.
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

/// Pings per server returned by `latest` when the client gives no limit.
pub const DEFAULT_LATEST_LIMIT: usize = 20;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// A client request. `action` selects what to do.
#[derive(Debug, Default, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub server_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ClientMessage {
    fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter::new(self.server_ids.clone(), self.query.clone(), None)
    }
}

pub async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
) -> Response {
    let authorized = is_authorized(
        state.config.api_token.as_deref(),
        params.token.as_deref(),
        &headers,
    );

    ws.on_upgrade(move |socket| async move {
        if authorized {
            run_socket(socket, state).await;
        } else {
            close_unauthenticated(socket).await;
        }
    })
}

/// Accept a token from the `token` query parameter or a bearer header.
pub fn is_authorized(expected: Option<&str>, query_token: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    if query_token == Some(expected) {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token.trim() == expected)
}

async fn close_unauthenticated(mut socket: WebSocket) {
    tracing::debug!("Rejecting unauthenticated WebSocket client");
    let frame = CloseFrame {
        code: UNAUTHENTICATED_CLOSE_CODE,
        reason: "unauthenticated".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

async fn run_socket(mut socket: WebSocket, state: AppState) {
    let mut subscriber: Option<Subscriber> = None;

    loop {
        tokio::select! {
            _ = state.shutdown.wait() => {
                let frame = CloseFrame {
                    code: GOING_AWAY_CLOSE_CODE,
                    reason: "server shutting down".into(),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
                break;
            }
            incoming = socket.recv() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = handle_client_message(&state, &mut subscriber, text.as_str());
                if send_json(&mut socket, &reply).await.is_err() {
                    break;
                }
            }
            event = next_event(subscriber.as_ref()) => {
                match event {
                    Some(event) => {
                        if let Some(payload) = live_payload(&event) {
                            if send_json(&mut socket, &payload).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => subscriber = None,
                }
            }
        }
    }
}

async fn next_event(subscriber: Option<&Subscriber>) -> Option<Arc<Event>> {
    match subscriber {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

async fn send_json(socket: &mut WebSocket, value: &Value) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string().into())).await
}

/// Only check updates are pushed live.
fn live_payload(event: &Event) -> Option<Value> {
    match event {
        Event::Update(_) => serde_json::to_value(event).ok(),
        Event::Status(_) | Event::Ping(_) => None,
    }
}

/// Answer one client message, updating the subscription if asked to.
pub fn handle_client_message(state: &AppState, subscriber: &mut Option<Subscriber>, text: &str) -> Value {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(_) => return json!({ "error": "invalid message" }),
    };

    let result = match message.action.as_deref() {
        Some("latest") => latest(state, &message),
        Some("subscribe") => subscribe(state, subscriber, &message),
        _ => return json!({ "error": "unknown action" }),
    };
    result.unwrap_or_else(|e| {
        tracing::error!("WebSocket request failed: {}", e);
        json!({ "error": "internal error" })
    })
}

/// Servers selected by the message, ordered by id.
fn selected_servers(state: &AppState, message: &ClientMessage) -> Result<Vec<Server>, DbError> {
    let filter = message.filter();
    let mut servers: Vec<Server> = state
        .store
        .list_servers()?
        .into_iter()
        .filter(|s| filter.matches_server(s.id, &s.name))
        .collect();
    servers.sort_by_key(|s| s.id);
    Ok(servers)
}

fn latest(state: &AppState, message: &ClientMessage) -> Result<Value, DbError> {
    let servers = selected_servers(state, message)?;
    let ids: Vec<i64> = servers.iter().map(|s| s.id).collect();
    let limit = message.limit.filter(|n| *n > 0).unwrap_or(DEFAULT_LATEST_LIMIT);

    let mut statuses = state.store.query_statuses(&StatusQuery {
        server_ids: Some(ids.clone()),
        ..Default::default()
    })?;
    statuses.sort_by_key(|s| s.status.server_id);

    let mut pings = Vec::new();
    for id in ids {
        pings.extend(state.store.query_pings(&PingQuery {
            server_ids: Some(vec![id]),
            limit: Some(limit),
            ..Default::default()
        })?);
    }

    Ok(json!({ "type": "latest", "statuses": statuses, "pings": pings }))
}

fn subscribe(
    state: &AppState,
    subscriber: &mut Option<Subscriber>,
    message: &ClientMessage,
) -> Result<Value, DbError> {
    let filter = message.filter();
    match subscriber {
        Some(sub) => {
            sub.update_filter(filter);
        }
        None => *subscriber = Some(state.hub.subscribe(filter)),
    }

    let ids: Vec<i64> = selected_servers(state, message)?.iter().map(|s| s.id).collect();
    Ok(json!({ "type": "subscribed", "servers": ids }))
}
