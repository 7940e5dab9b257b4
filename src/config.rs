//! Configuration module for pulseguard.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// What a full subscriber queue does with a new event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued event to make room.
    DropOldest,
    /// Discard the incoming event.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "drop-oldest" | "oldest" => Ok(OverflowPolicy::DropOldest),
            "drop-newest" | "newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy: {other}")),
        }
    }
}

/// The rolling window used for uptime percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UptimeWindow {
    /// The last N results.
    Count(usize),
    /// Results newer than this age.
    Time(Duration),
}

impl FromStr for UptimeWindow {
    type Err = String;

    /// Accepts `count:<n>` or `time:<seconds>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected count:<n> or time:<secs>, got {s}"))?;
        let value: u64 = value.trim().parse().map_err(|_| format!("bad window size: {value}"))?;
        if value == 0 {
            return Err("window size must be positive".to_string());
        }
        match kind {
            "count" => Ok(UptimeWindow::Count(value as usize)),
            "time" => Ok(UptimeWindow::Time(Duration::from_secs(value))),
            other => Err(format!("unknown window kind: {other}")),
        }
    }
}

/// Which HTTP status codes count as a successful check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCodePolicy {
    /// Anything below 500 is up; client errors still mean the server answered.
    Below500,
    /// Only 2xx is up.
    Only2xx,
}

impl StatusCodePolicy {
    pub fn is_success(&self, code: u16) -> bool {
        match self {
            StatusCodePolicy::Below500 => code < 500,
            StatusCodePolicy::Only2xx => (200..300).contains(&code),
        }
    }
}

impl FromStr for StatusCodePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "below-500" => Ok(StatusCodePolicy::Below500),
            "only-2xx" => Ok(StatusCodePolicy::Only2xx),
            other => Err(format!("unknown status policy: {other}")),
        }
    }
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "pulseguard.db")
    pub db_path: String,
    /// Scheduler tick period (default: 1s)
    pub tick_interval: Duration,
    /// Worker pool size for probes (default: 50)
    pub max_concurrency: usize,
    /// How often the scheduler reloads server definitions (default: 30s)
    pub refresh_interval: Duration,
    /// Consecutive failures before a server is down (default: 3)
    pub failure_threshold: u32,
    pub uptime_window: UptimeWindow,
    /// Per-subscriber queue bound (default: 256)
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    /// Idle heartbeat period on event streams (default: 15s)
    pub heartbeat_interval: Duration,
    /// Reconnect hint sent to stream clients (default: 5s)
    pub retry_hint: Duration,
    pub status_policy: StatusCodePolicy,
    /// Token WebSocket clients must present; unset disables the check.
    pub api_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "pulseguard.db".to_string(),
            tick_interval: Duration::from_secs(1),
            max_concurrency: 50,
            refresh_interval: Duration::from_secs(30),
            failure_threshold: 3,
            uptime_window: UptimeWindow::Count(100),
            queue_capacity: 256,
            overflow_policy: OverflowPolicy::DropOldest,
            heartbeat_interval: Duration::from_secs(15),
            retry_hint: Duration::from_millis(5000),
            status_policy: StatusCodePolicy::Below500,
            api_token: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (all prefixed `PULSEGUARD_`):
    /// `HTTP_PORT`, `DB_PATH`, `TICK_MS`, `MAX_CONCURRENCY`, `REFRESH_SECS`,
    /// `FAILURE_THRESHOLD`, `UPTIME_WINDOW`, `QUEUE_CAPACITY`,
    /// `OVERFLOW_POLICY`, `HEARTBEAT_SECS`, `RETRY_MS`, `HTTP_STATUS_POLICY`,
    /// `API_TOKEN`. Unparseable values keep the default.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |name: &str| lookup(&format!("PULSEGUARD_{name}"));

        if let Some(port) = parsed(get("HTTP_PORT")) {
            cfg.http_port = port;
        }
        if let Some(db_path) = get("DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(ms) = parsed::<u64>(get("TICK_MS")) {
            cfg.tick_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = parsed::<usize>(get("MAX_CONCURRENCY")) {
            cfg.max_concurrency = n.max(1);
        }
        if let Some(secs) = parsed::<u64>(get("REFRESH_SECS")) {
            cfg.refresh_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed::<u32>(get("FAILURE_THRESHOLD")) {
            cfg.failure_threshold = n.max(1);
        }
        if let Some(window) = parsed(get("UPTIME_WINDOW")) {
            cfg.uptime_window = window;
        }
        if let Some(n) = parsed::<usize>(get("QUEUE_CAPACITY")) {
            cfg.queue_capacity = n.max(1);
        }
        if let Some(policy) = parsed(get("OVERFLOW_POLICY")) {
            cfg.overflow_policy = policy;
        }
        if let Some(secs) = parsed::<u64>(get("HEARTBEAT_SECS")) {
            cfg.heartbeat_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = parsed::<u64>(get("RETRY_MS")) {
            cfg.retry_hint = Duration::from_millis(ms);
        }
        if let Some(policy) = parsed(get("HTTP_STATUS_POLICY")) {
            cfg.status_policy = policy;
        }
        cfg.api_token = get("API_TOKEN").filter(|t| !t.is_empty());

        cfg
    }
}

fn parsed<T: FromStr>(value: Option<String>) -> Option<T> {
    let value = value?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring unparseable config value {:?}", value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "pulseguard.db");
        assert_eq!(cfg.failure_threshold, 3);
        assert_eq!(cfg.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(cfg.uptime_window, UptimeWindow::Count(100));
    }

    #[test]
    fn test_from_lookup_overrides() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("PULSEGUARD_HTTP_PORT", "9090"),
            ("PULSEGUARD_TICK_MS", "250"),
            ("PULSEGUARD_MAX_CONCURRENCY", "0"),
            ("PULSEGUARD_UPTIME_WINDOW", "time:3600"),
            ("PULSEGUARD_OVERFLOW_POLICY", "drop-newest"),
            ("PULSEGUARD_HTTP_STATUS_POLICY", "only-2xx"),
            ("PULSEGUARD_API_TOKEN", "s3cret"),
        ]));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.tick_interval, Duration::from_millis(250));
        assert_eq!(cfg.max_concurrency, 1);
        assert_eq!(cfg.uptime_window, UptimeWindow::Time(Duration::from_secs(3600)));
        assert_eq!(cfg.overflow_policy, OverflowPolicy::DropNewest);
        assert_eq!(cfg.status_policy, StatusCodePolicy::Only2xx);
        assert_eq!(cfg.api_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_malformed_values_keep_defaults() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("PULSEGUARD_HTTP_PORT", "eighty"),
            ("PULSEGUARD_UPTIME_WINDOW", "count:0"),
            ("PULSEGUARD_OVERFLOW_POLICY", "sometimes"),
            ("PULSEGUARD_API_TOKEN", ""),
        ]));
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.uptime_window, UptimeWindow::Count(100));
        assert_eq!(cfg.overflow_policy, OverflowPolicy::DropOldest);
        assert!(cfg.api_token.is_none());
    }

    #[test]
    fn test_status_code_policy() {
        assert!(StatusCodePolicy::Below500.is_success(404));
        assert!(!StatusCodePolicy::Below500.is_success(503));
        assert!(StatusCodePolicy::Only2xx.is_success(204));
        assert!(!StatusCodePolicy::Only2xx.is_success(301));
    }
}
