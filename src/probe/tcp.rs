//! TCP connect probe.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout_at, Instant};

use super::{ProbeError, Reply};

/// Open (and immediately close) a TCP connection to `host:port`.
///
/// Every resolved address is tried in turn until one accepts or the overall
/// deadline passes.
pub async fn run_tcp_probe(host: &str, port: u16, timeout: Duration) -> Result<Reply, ProbeError> {
    let deadline = Instant::now() + timeout;

    let addrs: Vec<SocketAddr> = timeout_at(deadline, lookup_host((host, port)))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Dns(format!("{}: {}", host, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(ProbeError::Dns(format!("no addresses found for {}", host)));
    }

    let mut last_error = None;
    for addr in addrs {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => return Ok(Reply::default()),
            Ok(Err(e)) => last_error = Some((addr, e)),
            Err(_) => return Err(ProbeError::Timeout(timeout)),
        }
    }

    Err(match last_error {
        Some((addr, e)) if e.kind() == ErrorKind::ConnectionRefused => {
            ProbeError::Refused(addr.to_string())
        }
        Some((addr, e)) => ProbeError::Network(format!("{}: {}", addr, e)),
        None => ProbeError::Network(format!("could not connect to {}:{}", host, port)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let reply = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await;
        assert_eq!(reply, Ok(Reply::default()));
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = run_tcp_probe("127.0.0.1", port, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err, ProbeError::Refused(format!("127.0.0.1:{port}")));
    }

    #[tokio::test]
    async fn test_tcp_probe_dns_failure() {
        let err = run_tcp_probe("no-such-host.invalid", 80, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Dns(_) | ProbeError::Timeout(_)));
    }
}
