//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default check interval in seconds.
pub const DEFAULT_CHECK_INTERVAL: f64 = 300.0;
/// Default probe timeout in seconds.
pub const DEFAULT_TIMEOUT: f64 = 10.0;
/// Longest accepted check interval in seconds (30 days).
pub const MAX_CHECK_INTERVAL: f64 = 30.0 * 24.0 * 3600.0;
/// Longest accepted probe timeout in seconds.
pub const MAX_TIMEOUT: f64 = 3600.0;

/// A malformed target descriptor. The server is skipped until it is corrected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TargetError {
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("host is empty")]
    EmptyHost,
    #[error("port must be non-zero for {0}")]
    ZeroPort(Protocol),
    #[error("http path must start with '/': {0}")]
    BadPath(String),
    #[error("check interval must be positive and at most {MAX_CHECK_INTERVAL} seconds")]
    BadInterval,
    #[error("timeout must be positive and at most {MAX_TIMEOUT} seconds")]
    BadTimeout,
}

/// Probe protocol of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Icmp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Icmp => "icmp",
        }
    }

    pub fn is_http(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TargetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "tcp" => Ok(Protocol::Tcp),
            "icmp" | "ping" => Ok(Protocol::Icmp),
            other => Err(TargetError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A monitored server definition.
///
/// `protocol` is kept as stored text so a bad row still loads and can be
/// reported; [`Server::target`] does the validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    /// Seconds between checks.
    pub check_interval: f64,
    /// Probe timeout in seconds.
    pub timeout: f64,
    pub enabled: bool,
    pub tags: Vec<String>,
    /// Overrides the configured failure threshold when set.
    pub failure_threshold: Option<u32>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            protocol: "https".to_string(),
            host: String::new(),
            port: 443,
            path: "/".to_string(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            enabled: true,
            tags: Vec::new(),
            failure_threshold: None,
        }
    }
}

impl Server {
    pub fn interval(&self) -> Duration {
        seconds_or(self.check_interval, MAX_CHECK_INTERVAL, DEFAULT_CHECK_INTERVAL)
    }

    pub fn timeout(&self) -> Duration {
        seconds_or(self.timeout, MAX_TIMEOUT, DEFAULT_TIMEOUT)
    }

    /// Parse and validate the target descriptor.
    pub fn target(&self) -> Result<Target, TargetError> {
        let protocol: Protocol = self.protocol.parse()?;
        let host = self.host.trim();
        if host.is_empty() {
            return Err(TargetError::EmptyHost);
        }
        if self.port == 0 && protocol != Protocol::Icmp {
            return Err(TargetError::ZeroPort(protocol));
        }
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        if protocol.is_http() && !path.starts_with('/') {
            return Err(TargetError::BadPath(path.to_string()));
        }
        if !in_range(self.check_interval, MAX_CHECK_INTERVAL) {
            return Err(TargetError::BadInterval);
        }
        if !in_range(self.timeout, MAX_TIMEOUT) {
            return Err(TargetError::BadTimeout);
        }

        Ok(Target {
            protocol,
            host: host.to_string(),
            port: self.port,
            path: path.to_string(),
        })
    }

    /// Tags serialized the way they are stored.
    pub fn tags_csv(&self) -> String {
        self.tags.join(",")
    }

    pub fn parse_tags(csv: &str) -> Vec<String> {
        csv.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect()
    }
}

fn in_range(value: f64, max: f64) -> bool {
    value > 0.0 && value <= max
}

/// `value` seconds, or `fallback` seconds when out of `(0, max]`.
fn seconds_or(value: f64, max: f64, fallback: f64) -> Duration {
    let secs = if in_range(value, max) { value } else { fallback };
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(fallback as u64))
}

/// A validated probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Target {
    /// Full URL for HTTP(S) targets.
    pub fn full_url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, self.path)
    }
}

/// Outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Success,
    Failure,
    Timeout,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Success => "success",
            CheckStatus::Failure => "failure",
            CheckStatus::Timeout => "timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == CheckStatus::Success
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(CheckStatus::Success),
            "failure" | "error" => Ok(CheckStatus::Failure),
            "timeout" => Ok(CheckStatus::Timeout),
            other => Err(format!("unknown check status: {other}")),
        }
    }
}

/// One probe outcome. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingResult {
    pub server_id: i64,
    pub status: CheckStatus,
    /// Wall-clock milliseconds from dispatch to response or timeout.
    pub response_time_ms: f64,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate health of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Up,
    Degraded,
    Down,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Up => "up",
            StatusKind::Degraded => "degraded",
            StatusKind::Down => "down",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, StatusKind::Up)
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatusKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(StatusKind::Up),
            "degraded" => Ok(StatusKind::Degraded),
            "down" => Ok(StatusKind::Down),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Current aggregate view of a server, written only by the aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server_id: i64,
    pub status: StatusKind,
    pub uptime_percentage: f64,
    pub last_check: DateTime<Utc>,
    pub last_up: Option<DateTime<Utc>>,
    pub last_down: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

/// A status together with the server's current name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub status: ServerStatus,
}

/// A ping result together with the server's current name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PingSnapshot {
    pub name: String,
    #[serde(flatten)]
    pub ping: PingResult,
}

/// Filters for status queries.
#[derive(Debug, Clone, Default)]
pub struct StatusQuery {
    pub status: Option<StatusKind>,
    pub server_ids: Option<Vec<i64>>,
    /// Only statuses updated strictly after this time.
    pub since: Option<DateTime<Utc>>,
}

/// Filters for ping history queries. Results come newest first.
#[derive(Debug, Clone, Default)]
pub struct PingQuery {
    pub server_ids: Option<Vec<i64>>,
    pub status: Option<CheckStatus>,
    /// Only results checked strictly after this time.
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Fleet-wide metrics for the overview endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Overview {
    pub servers: ServerCounts,
    pub checks_last_24h: CheckCounts,
    pub avg_response_time_ms: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ServerCounts {
    pub total: i64,
    pub enabled: i64,
    pub disabled: i64,
    pub up: i64,
    pub degraded: i64,
    pub down: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckCounts {
    pub total: i64,
    pub successful: i64,
    pub failed: i64,
    pub success_rate: f64,
}

/// Window of the per-server uptime report.
pub const UPTIME_REPORT_DAYS: i64 = 30;
/// Window of the failure report.
pub const FAILURE_REPORT_DAYS: i64 = 7;
/// Failures listed individually in the failure report.
pub const RECENT_FAILURES_LIMIT: usize = 20;
/// Servers listed in the failure report's ranking.
pub const TOP_FAILING_LIMIT: usize = 10;

/// Uptime of every enabled server over the report window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UptimeReport {
    pub period_days: i64,
    pub servers: Vec<ServerUptime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerUptime {
    pub server_id: i64,
    pub server_name: String,
    pub protocol: String,
    pub host: String,
    /// Zero when the server has no checks in the window.
    pub uptime_percentage: f64,
    pub total_checks: i64,
    pub successful_checks: i64,
    /// `None` until the first check completes.
    pub current_status: Option<StatusKind>,
    pub last_check: Option<DateTime<Utc>>,
}

/// Response times of successful checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseTimeReport {
    pub period_hours: u32,
    pub overall: ResponseTimeStats,
    /// Slowest server first.
    pub by_server: Vec<ServerResponseTimes>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseTimeStats {
    pub avg_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub total_checks: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerResponseTimes {
    pub server_id: i64,
    pub server_name: String,
    pub server_host: String,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub check_count: i64,
}

/// Failed and timed-out checks over the report window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureReport {
    pub period_days: i64,
    pub total_failures: i64,
    pub by_type: FailureCounts,
    /// Newest first.
    pub recent_failures: Vec<PingSnapshot>,
    pub top_failing_servers: Vec<FailingServer>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureCounts {
    pub timeout: i64,
    pub failure: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailingServer {
    pub server_id: i64,
    pub server_name: String,
    pub server_host: String,
    pub failure_count: i64,
}
