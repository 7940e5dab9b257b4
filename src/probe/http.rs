//! HTTP probe implementation.

use std::error::Error as StdError;
use std::time::Duration;

use super::{ProbeError, Reply};
use crate::config::StatusCodePolicy;

/// Run an HTTP GET against `url`.
///
/// The body is read in full so the check covers the complete transfer.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    policy: StatusCodePolicy,
) -> Result<Reply, ProbeError> {
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let code = response.status().as_u16();

    let _body = response.bytes().await.map_err(|e| classify(e, timeout))?;

    if !policy.is_success(code) {
        return Err(ProbeError::BadStatus(code));
    }

    Ok(Reply {
        status_code: Some(code),
    })
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    let detail = error_chain(&e);
    if e.is_connect() {
        if has_io_kind(&e, std::io::ErrorKind::ConnectionRefused) {
            return ProbeError::Refused(detail);
        }
        let lower = detail.to_ascii_lowercase();
        if lower.contains("dns error") || lower.contains("failed to lookup address") {
            return ProbeError::Dns(detail);
        }
    }
    ProbeError::Network(detail)
}

/// Render an error and all of its sources on one line.
fn error_chain(e: &(dyn StdError + 'static)) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = inner.source();
    }
    out
}

fn has_io_kind(e: &(dyn StdError + 'static), kind: std::io::ErrorKind) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(e);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == kind {
                return true;
            }
        }
        current = err.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer one request with the given status line.
    async fn serve_once(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        addr
    }

    fn client() -> reqwest::Client {
        reqwest::Client::new()
    }

    #[tokio::test]
    async fn test_http_probe_ok() {
        let addr = serve_once("200 OK").await;
        let reply = run_http_probe(
            &client(),
            &format!("http://{addr}/health"),
            Duration::from_secs(2),
            StatusCodePolicy::Below500,
        )
        .await
        .unwrap();
        assert_eq!(reply.status_code, Some(200));
    }

    #[tokio::test]
    async fn test_http_probe_server_error_is_bad_status() {
        let addr = serve_once("503 Service Unavailable").await;
        let err = run_http_probe(
            &client(),
            &format!("http://{addr}/"),
            Duration::from_secs(2),
            StatusCodePolicy::Below500,
        )
        .await
        .unwrap_err();
        assert_eq!(err, ProbeError::BadStatus(503));
    }

    #[tokio::test]
    async fn test_http_probe_policy_decides_client_errors() {
        let addr = serve_once("404 Not Found").await;
        let lenient = run_http_probe(
            &client(),
            &format!("http://{addr}/"),
            Duration::from_secs(2),
            StatusCodePolicy::Below500,
        )
        .await;
        assert_eq!(lenient.unwrap().status_code, Some(404));

        let addr = serve_once("404 Not Found").await;
        let strict = run_http_probe(
            &client(),
            &format!("http://{addr}/"),
            Duration::from_secs(2),
            StatusCodePolicy::Only2xx,
        )
        .await;
        assert_eq!(strict.unwrap_err(), ProbeError::BadStatus(404));
    }

    #[tokio::test]
    async fn test_http_probe_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold the connection without answering
        let hold = tokio::spawn(async move {
            let conn = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(conn);
        });

        let err = run_http_probe(
            &client(),
            &format!("http://{addr}/"),
            Duration::from_millis(200),
            StatusCodePolicy::Below500,
        )
        .await
        .unwrap_err();
        assert_eq!(err, ProbeError::Timeout(Duration::from_millis(200)));
        hold.abort();
    }

    #[tokio::test]
    async fn test_http_probe_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = run_http_probe(
            &client(),
            &format!("http://{addr}/"),
            Duration::from_secs(2),
            StatusCodePolicy::Below500,
        )
        .await
        .unwrap_err();
        assert!(!matches!(err, ProbeError::BadStatus(_) | ProbeError::Timeout(_)));
    }

    #[test]
    fn test_has_io_kind_walks_sources() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl std::fmt::Display for Wrapper {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("wrapped")
            }
        }
        impl StdError for Wrapper {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }

        let e = Wrapper(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(has_io_kind(&e, std::io::ErrorKind::ConnectionRefused));
        assert!(!has_io_kind(&e, std::io::ErrorKind::TimedOut));
        assert!(error_chain(&e).starts_with("wrapped: "));
    }
}
