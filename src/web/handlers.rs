//! HTTP request handlers.

use super::AppState;
use crate::db::{
    CheckStatus, DbError, DurableStore, PingQuery, Server, StatusKind, StatusQuery,
    DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::json;

// ============================================================================
// Shared helpers
// ============================================================================

pub(crate) fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        DbError::Sqlite(ref inner)
            if inner.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) =>
        {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        e => {
            tracing::error!("Database error: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Parse `1,2,3`. Blank input means no filter.
pub(crate) fn parse_id_list(raw: Option<&str>) -> Result<Option<Vec<i64>>, String> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().map_err(|_| format!("invalid server_id: {s}")))
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

/// Parse an RFC 3339 timestamp, or a naive one taken as UTC.
///
/// A `+` in the offset often arrives URL-decoded as a space, so a space
/// after the time part is read as `+`.
pub(crate) fn parse_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let fixed = if raw.contains('T') {
        raw.replace(' ', "+")
    } else {
        raw.to_string()
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&fixed) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(Some(naive.and_utc()));
        }
    }
    Err(format!("invalid timestamp: {raw}"))
}

pub(crate) fn parse_opt<T: std::str::FromStr>(raw: Option<&str>, what: &str) -> Result<Option<T>, String> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => s.parse().map(Some).map_err(|_| format!("invalid {what}: {s}")),
        None => Ok(None),
    }
}

fn bad_request(msg: String) -> Response {
    (StatusCode::BAD_REQUEST, msg).into_response()
}

fn invalidate_schedule(state: &AppState) {
    if let Err(e) = state.scheduler.invalidate() {
        tracing::warn!("Server definitions changed but {}", e);
    }
}

// ============================================================================
// API: Servers
// ============================================================================

pub async fn handle_get_servers(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_servers() {
        Ok(servers) => Json(servers).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub check_interval: Option<f64>,
    #[serde(default)]
    pub timeout: Option<f64>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

fn default_protocol() -> String {
    "https".to_string()
}

impl ServerRequest {
    /// Apply the request on top of `base`; absent fields keep their value.
    fn apply_to(self, base: Server) -> Server {
        Server {
            name: self.name.trim().to_string(),
            protocol: self.protocol.trim().to_lowercase(),
            host: self.host.trim().to_string(),
            port: self.port.unwrap_or(base.port),
            path: self.path.unwrap_or(base.path),
            check_interval: self.check_interval.unwrap_or(base.check_interval),
            timeout: self.timeout.unwrap_or(base.timeout),
            enabled: self.enabled.unwrap_or(base.enabled),
            tags: self.tags.unwrap_or(base.tags),
            failure_threshold: self.failure_threshold.or(base.failure_threshold),
            ..base
        }
    }
}

fn validate(server: &Server) -> Result<(), String> {
    if server.name.is_empty() {
        return Err("name is required".to_string());
    }
    server.target().map(|_| ()).map_err(|e| e.to_string())
}

pub async fn handle_create_server(
    State(state): State<AppState>,
    Json(req): Json<ServerRequest>,
) -> impl IntoResponse {
    let mut server = req.apply_to(Server {
        check_interval: DEFAULT_CHECK_INTERVAL,
        timeout: DEFAULT_TIMEOUT,
        ..Default::default()
    });
    if let Err(msg) = validate(&server) {
        return bad_request(msg);
    }

    match state.store.add_server(&mut server) {
        Ok(_) => {
            tracing::info!("Added server {} ({})", server.name, server.id);
            invalidate_schedule(&state);
            (StatusCode::CREATED, Json(server)).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_update_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ServerRequest>,
) -> impl IntoResponse {
    let existing = match state.store.get_server(id) {
        Ok(s) => s,
        Err(e) => return db_error_response(e),
    };

    let updated = req.apply_to(existing);
    if let Err(msg) = validate(&updated) {
        return bad_request(msg);
    }

    match state.store.update_server(&updated) {
        Ok(()) => {
            invalidate_schedule(&state);
            Json(updated).into_response()
        }
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_delete_server(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.store.delete_server(id) {
        Ok(()) => {
            tracing::info!("Deleted server {}", id);
            invalidate_schedule(&state);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Statuses and pings
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct StatusParams {
    pub status: Option<String>,
    pub server_id: Option<String>,
    pub since: Option<String>,
}

impl StatusParams {
    pub(crate) fn to_query(&self) -> Result<StatusQuery, String> {
        Ok(StatusQuery {
            status: parse_opt::<StatusKind>(self.status.as_deref(), "status")?,
            server_ids: parse_id_list(self.server_id.as_deref())?,
            since: parse_time(self.since.as_deref())?,
        })
    }
}

pub async fn handle_get_statuses(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> impl IntoResponse {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };
    match state.store.query_statuses(&query) {
        Ok(statuses) => Json(statuses).into_response(),
        Err(e) => db_error_response(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PingParams {
    pub server_id: Option<String>,
    pub status: Option<String>,
    pub since: Option<String>,
    pub limit: Option<usize>,
}

impl PingParams {
    fn to_query(&self) -> Result<PingQuery, String> {
        Ok(PingQuery {
            server_ids: parse_id_list(self.server_id.as_deref())?,
            status: parse_opt::<CheckStatus>(self.status.as_deref(), "status")?,
            since: parse_time(self.since.as_deref())?,
            limit: Some(self.limit.unwrap_or(100).min(1000)),
        })
    }
}

pub async fn handle_get_pings(
    State(state): State<AppState>,
    Query(params): Query<PingParams>,
) -> impl IntoResponse {
    let query = match params.to_query() {
        Ok(q) => q,
        Err(msg) => return bad_request(msg),
    };
    match state.store.query_pings(&query) {
        Ok(pings) => Json(pings).into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// API: Checks, metrics, hub
// ============================================================================

pub async fn handle_run_checks(State(state): State<AppState>) -> impl IntoResponse {
    match state.scheduler.trigger_all() {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "checks queued" })),
        )
            .into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

pub async fn handle_metrics_overview(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.overview(Utc::now()) {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_metrics_uptime(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.uptime_report(Utc::now()) {
        Ok(report) => Json(report).into_response(),
        Err(e) => db_error_response(e),
    }
}

/// Longest response-time window accepted, one year.
pub const MAX_REPORT_HOURS: u32 = 24 * 365;

#[derive(Debug, Default, Deserialize)]
pub struct ResponseTimeParams {
    pub hours: Option<String>,
}

pub async fn handle_metrics_response_times(
    State(state): State<AppState>,
    Query(params): Query<ResponseTimeParams>,
) -> impl IntoResponse {
    let hours = match parse_opt::<u32>(params.hours.as_deref(), "hours") {
        Ok(hours) => hours.unwrap_or(24),
        Err(msg) => return bad_request(msg),
    };
    if hours == 0 || hours > MAX_REPORT_HOURS {
        return bad_request(format!("hours must be between 1 and {MAX_REPORT_HOURS}"));
    }
    match state.store.response_times(Utc::now(), hours) {
        Ok(report) => Json(report).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_metrics_failures(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.failure_report(Utc::now()) {
        Ok(report) => Json(report).into_response(),
        Err(e) => db_error_response(e),
    }
}

pub async fn handle_hub_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.stats())
}
