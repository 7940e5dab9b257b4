//! ICMP echo probe with a native socket path and a `ping` command fallback.
//!
//! Native echo runs on a blocking socket inside `spawn_blocking`. Raw sockets
//! need CAP_NET_RAW; unprivileged datagram sockets work on macOS and on Linux
//! when `net.ipv4.ping_group_range` allows it.

use std::io::{ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{ProbeError, Reply};

static NATIVE_ICMP: OnceLock<bool> = OnceLock::new();
static SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Address-family specifics of an echo exchange.
#[derive(Debug, Clone, Copy)]
struct Family {
    domain: Domain,
    protocol: Protocol,
    request_type: u8,
    reply_type: u8,
    /// ICMPv6 checksums are filled in by the kernel.
    needs_checksum: bool,
}

const V4: Family = Family {
    domain: Domain::IPV4,
    protocol: Protocol::ICMPV4,
    request_type: 8,
    reply_type: 0,
    needs_checksum: true,
};

const V6: Family = Family {
    domain: Domain::IPV6,
    protocol: Protocol::ICMPV6,
    request_type: 128,
    reply_type: 129,
    needs_checksum: false,
};

/// Which kind of ICMP socket could be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
    Raw,
    /// Unprivileged ping socket. Linux rewrites the echo identifier to the
    /// socket's own, so replies can only be matched on sequence.
    Datagram,
}

fn open_socket(family: Family) -> std::io::Result<(Socket, SocketKind)> {
    match Socket::new(family.domain, Type::RAW, Some(family.protocol)) {
        Ok(socket) => Ok((socket, SocketKind::Raw)),
        Err(_) => Socket::new(family.domain, Type::DGRAM, Some(family.protocol))
            .map(|socket| (socket, SocketKind::Datagram)),
    }
}

fn native_available() -> bool {
    *NATIVE_ICMP.get_or_init(|| {
        let ok = open_socket(V4).is_ok();
        if ok {
            tracing::info!("ICMP probe: using native sockets");
        } else {
            tracing::info!("ICMP probe: native sockets unavailable, using ping command");
        }
        ok
    })
}

/// Send one echo request to `host` and wait for the matching reply.
pub async fn run_icmp_probe(host: &str, timeout: Duration) -> Result<Reply, ProbeError> {
    if !native_available() {
        return run_ping_command(host, timeout).await;
    }

    let ip = resolve(host).await?;
    let result = tokio::task::spawn_blocking(move || echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("echo task failed: {}", e)))?;

    match result {
        Err(ProbeError::Network(msg)) if msg.contains("Permission denied") => {
            tracing::warn!("Native ICMP to {} not permitted, falling back to ping command", host);
            run_ping_command(host, timeout).await
        }
        other => other.map(|_| Reply::default()),
    }
}

async fn resolve(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Dns(format!("{}: {}", host, e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Dns(format!("no addresses found for {}", host)))
}

fn echo(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let family = if ip.is_ipv4() { V4 } else { V6 };
    let io_err = |what: &str, e: std::io::Error| ProbeError::Network(format!("{}: {}", what, e));

    let (socket, kind) = open_socket(family).map_err(|e| io_err("failed to open ICMP socket", e))?;
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| io_err("failed to set timeout", e))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| io_err("failed to connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = build_echo_request(family, identifier, sequence);

    let start = Instant::now();
    socket.send(&packet).map_err(|e| io_err("failed to send", e))?;

    let mut buf = [0u8; 1500];
    loop {
        let len = (&socket).read(&mut buf).map_err(|e| match e.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => ProbeError::Timeout(timeout),
            _ => io_err("failed to receive", e),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_our_reply(family, kind, &buf[..len], identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Echo request: 8-byte header plus a 56-byte payload.
fn build_echo_request(family: Family, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = family.request_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&rand::random::<u64>().to_be_bytes());

    if family.needs_checksum {
        let checksum = checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

fn is_our_reply(family: Family, kind: SocketKind, buf: &[u8], identifier: u16, sequence: u16) -> bool {
    // Raw IPv4 sockets hand back the IP header too
    let offset = if family.needs_checksum && buf.first().map(|b| b >> 4) == Some(4) {
        usize::from(buf[0] & 0x0f) * 4
    } else {
        0
    };
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };
    let id_matches = match kind {
        SocketKind::Raw => u16::from_be_bytes([icmp[4], icmp[5]]) == identifier,
        SocketKind::Datagram => true,
    };
    icmp[0] == family.reply_type && id_matches && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(host: &str, timeout: Duration) -> Result<Reply, ProbeError> {
    let wait_secs = timeout.as_secs().max(1).to_string();
    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait_secs, host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if output.status.success() {
        return Ok(Reply::default());
    }
    if packet_loss(&stdout) == Some(100.0) {
        return Err(ProbeError::Timeout(timeout));
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Name or service not known") || stderr.contains("cannot resolve") {
        return Err(ProbeError::Dns(stderr.trim().to_string()));
    }
    Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())))
}

/// Packet loss percentage from a `ping` summary line.
fn packet_loss(output: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?P<pct>[0-9.]+)% packet loss").expect("packet loss pattern is valid")
    });
    re.captures(output)?.name("pct")?.as_str().parse().ok()
}
