//! Probe module for network health checks.
//!
//! Supports HTTP(S), TCP and ICMP probes behind the [`Probe`] strategy trait.
//! [`execute`] is the only entry point the scheduler uses: it bounds every
//! attempt by the server's timeout and folds every failure mode into a
//! [`PingResult`].

mod http;
mod icmp;
mod tcp;

pub use http::*;
pub use icmp::*;
pub use tcp::*;

use crate::config::StatusCodePolicy;
use crate::db::{CheckStatus, PingResult, Protocol, Target};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// What a probe reports when the target answered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    pub status_code: Option<u16>,
}

/// A pluggable check strategy: one attempt against one target.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, target: &Target, timeout: Duration) -> Result<Reply, ProbeError>;
}

/// The default strategy, dispatching on the target's protocol.
#[derive(Clone)]
pub struct NetworkProbe {
    client: reqwest::Client,
    policy: StatusCodePolicy,
}

impl NetworkProbe {
    pub fn new(policy: StatusCodePolicy) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("pulseguard/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl Probe for NetworkProbe {
    async fn check(&self, target: &Target, timeout: Duration) -> Result<Reply, ProbeError> {
        match target.protocol {
            Protocol::Http | Protocol::Https => {
                run_http_probe(&self.client, &target.full_url(), timeout, self.policy).await
            }
            Protocol::Tcp => run_tcp_probe(&target.host, target.port, timeout).await,
            Protocol::Icmp => run_icmp_probe(&target.host, timeout).await,
        }
    }
}

/// Run exactly one check attempt and describe it as a [`PingResult`].
///
/// The attempt is cancelled once `timeout` elapses. Errors and panics inside
/// the probe become failure results.
pub async fn execute(probe: &dyn Probe, server_id: i64, target: &Target, timeout: Duration) -> PingResult {
    let checked_at = Utc::now();
    let start = Instant::now();

    let attempt = AssertUnwindSafe(probe.check(target, timeout)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout, attempt).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(ProbeError::Network("probe panicked".to_string())),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    };
    let elapsed = start.elapsed();

    // Enforce timeout even when the probe itself answered late
    let outcome = match outcome {
        Ok(_) if elapsed >= timeout => Err(ProbeError::Timeout(timeout)),
        other => other,
    };

    let (status, status_code, error_message) = match outcome {
        Ok(reply) => (CheckStatus::Success, reply.status_code, None),
        Err(e @ ProbeError::Timeout(_)) => (CheckStatus::Timeout, None, Some(e.to_string())),
        Err(e @ ProbeError::BadStatus(code)) => (CheckStatus::Failure, Some(code), Some(e.to_string())),
        Err(e) => (CheckStatus::Failure, None, Some(e.to_string())),
    };

    PingResult {
        server_id,
        status,
        response_time_ms: (elapsed.as_secs_f64() * 100_000.0).round() / 100.0,
        status_code,
        error_message,
        checked_at,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        async fn check(&self, _target: &Target, _timeout: Duration) -> Result<Reply, ProbeError> {
            panic!("boom");
        }
    }

    fn target() -> Target {
        Target {
            protocol: Protocol::Tcp,
            host: "db".to_string(),
            port: 5432,
            path: "/".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_success() {
        let probe = ScriptedProbe::with_delay(Duration::from_millis(40));
        let result = execute(&probe, 7, &target(), Duration::from_secs(1)).await;
        assert_eq!(result.server_id, 7);
        assert_eq!(result.status, CheckStatus::Success);
        assert!(result.error_message.is_none());
        assert!(result.response_time_ms >= 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_hard_timeout() {
        let probe = ScriptedProbe::default();
        probe.script("db", vec![Err(ProbeError::Timeout(Duration::ZERO))]);

        let start = Instant::now();
        let result = execute(&probe, 1, &target(), Duration::from_millis(500)).await;
        assert_eq!(result.status, CheckStatus::Timeout);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500) && waited < Duration::from_secs(1));
        assert!(result.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_execute_maps_errors_to_failures() {
        let probe = ScriptedProbe::default();
        probe.script(
            "db",
            vec![
                Err(ProbeError::Refused("127.0.0.1:1".to_string())),
                Err(ProbeError::BadStatus(502)),
            ],
        );

        let refused = execute(&probe, 1, &target(), Duration::from_secs(1)).await;
        assert_eq!(refused.status, CheckStatus::Failure);
        assert_eq!(
            refused.error_message.as_deref(),
            Some("connection refused: 127.0.0.1:1")
        );

        let bad = execute(&probe, 1, &target(), Duration::from_secs(1)).await;
        assert_eq!(bad.status, CheckStatus::Failure);
        assert_eq!(bad.status_code, Some(502));
    }

    #[tokio::test]
    async fn test_execute_survives_panicking_probe() {
        let result = execute(&PanickingProbe, 3, &target(), Duration::from_secs(1)).await;
        assert_eq!(result.status, CheckStatus::Failure);
        assert!(result.error_message.unwrap().contains("panicked"));
    }
}
