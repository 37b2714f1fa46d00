//! Connection audit
//!
//! Reads the TCP and UDP socket tables with `ss`. An established TCP
//! connection or connected UDP socket with a non-loopback peer must belong
//! to one of the proxy processes; anything else is traffic leaving the host
//! outside the anonymity layer.

use super::{ProbeKind, ProbeResult, Severity};
use crate::config::TrafficConfig;
use regex::Regex;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::OnceLock;
use tokio::process::Command;

/// One side of a socket; `None` stands for the `*` wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
}

impl Endpoint {
    fn is_loopback(&self) -> bool {
        self.ip.map(is_loopback).unwrap_or(false)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ip = self.ip.map(|ip| ip.to_string()).unwrap_or_else(|| "*".to_string());
        let port = self.port.map(|p| p.to_string()).unwrap_or_else(|| "*".to_string());
        write!(f, "{}:{}", ip, port)
    }
}

/// A row of `ss` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socket {
    /// `tcp` or `udp` when ss prints the Netid column
    pub protocol: Option<String>,
    pub local: Endpoint,
    pub peer: Endpoint,
    pub process: Option<String>,
}

/// What the audit found
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AuditFindings {
    /// Outbound connections owned by something other than the proxy
    pub leaks: Vec<Socket>,
    /// Outbound connections whose owner could not be read
    pub unattributed: Vec<Socket>,
    /// Listeners exposed beyond loopback on unexpected ports
    pub exposed: Vec<Socket>,
}

pub struct TrafficAuditProbe {
    config: TrafficConfig,
}

impl TrafficAuditProbe {
    pub fn new(config: TrafficConfig) -> Self {
        Self { config }
    }

    pub async fn check(&self) -> ProbeResult {
        // Connected UDP sockets report as established too
        let established = match self.ss(&["-Htunp", "state", "established"]).await {
            Ok(out) => parse_sockets(&out),
            Err(e) => return ProbeResult::fault(ProbeKind::TrafficAudit, e),
        };
        let listening = match self.ss(&["-Htulnp"]).await {
            Ok(out) => parse_sockets(&out),
            Err(e) => return ProbeResult::fault(ProbeKind::TrafficAudit, e),
        };

        let findings = audit(&established, &listening, &self.config);
        summarize(&findings, established.len())
    }

    async fn ss(&self, args: &[&str]) -> Result<String, String> {
        let output = Command::new(&self.config.ss_binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.config.ss_binary, e))?;

        if !output.status.success() {
            return Err(format!(
                "{} exited with {}: {}",
                self.config.ss_binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_loopback(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.to_ipv4_mapped().map(|v4| v4.is_loopback()).unwrap_or(false),
    }
}

/// Parse `addr:port` as printed by ss (`[::1]:9050`, `127.0.0.53%lo:53`, `*:22`)
pub fn parse_endpoint(s: &str) -> Option<Endpoint> {
    let (host, port) = s.rsplit_once(':')?;
    let port = match port {
        "*" => None,
        p => Some(p.parse().ok()?),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = host.split('%').next().unwrap_or(host);
    let ip = match host {
        "*" | "" => None,
        h => Some(h.parse().ok()?),
    };

    Some(Endpoint { ip, port })
}

fn process_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"users:\(\("([^"]+)""#).expect("static regex"))
}

/// Rows of `ss -H ... -p` output; the first two endpoint columns are local and peer
pub fn parse_sockets(output: &str) -> Vec<Socket> {
    output
        .lines()
        .filter_map(|line| {
            let mut endpoints = line
                .split_whitespace()
                .filter(|token| token.contains(':') && !token.starts_with("users:"))
                .filter_map(parse_endpoint);
            let local = endpoints.next()?;
            let peer = endpoints.next()?;
            let protocol = line
                .split_whitespace()
                .next()
                .filter(|netid| matches!(*netid, "tcp" | "udp"))
                .map(str::to_string);
            let process = process_regex()
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
            Some(Socket {
                protocol,
                local,
                peer,
                process,
            })
        })
        .collect()
}

/// Sort sockets into findings
pub fn audit(established: &[Socket], listening: &[Socket], config: &TrafficConfig) -> AuditFindings {
    let mut findings = AuditFindings::default();

    for socket in established {
        if socket.peer.is_loopback() {
            continue;
        }
        match &socket.process {
            Some(name) if config.proxy_processes.iter().any(|p| p == name) => {}
            Some(_) => findings.leaks.push(socket.clone()),
            None => findings.unattributed.push(socket.clone()),
        }
    }

    for socket in listening {
        if socket.local.is_loopback() {
            continue;
        }
        let allowed = socket
            .local
            .port
            .map(|port| config.allowed_listen_ports.contains(&port))
            .unwrap_or(false);
        if !allowed {
            findings.exposed.push(socket.clone());
        }
    }

    findings
}

fn describe(socket: &Socket) -> String {
    let protocol = socket.protocol.as_deref().map(|p| format!("{} ", p)).unwrap_or_default();
    format!(
        "{}{} -> {} ({})",
        protocol,
        socket.local,
        socket.peer,
        socket.process.as_deref().unwrap_or("unknown")
    )
}

/// Leaks are critical; unattributed connections and exposed listeners are warnings
pub fn summarize(findings: &AuditFindings, inspected: usize) -> ProbeResult {
    if let Some(first) = findings.leaks.first() {
        return ProbeResult::fail(
            ProbeKind::TrafficAudit,
            Severity::Critical,
            format!(
                "{} connection(s) outside the proxy, first: {}",
                findings.leaks.len(),
                describe(first)
            ),
        );
    }
    if let Some(first) = findings.unattributed.first() {
        return ProbeResult::fail(
            ProbeKind::TrafficAudit,
            Severity::Warning,
            format!(
                "{} connection(s) could not be attributed (run as root), first: {}",
                findings.unattributed.len(),
                describe(first)
            ),
        );
    }
    if let Some(first) = findings.exposed.first() {
        return ProbeResult::fail(
            ProbeKind::TrafficAudit,
            Severity::Warning,
            format!("unexpected listener on {} ({})", first.local, first.process.as_deref().unwrap_or("unknown")),
        );
    }
    ProbeResult::pass(
        ProbeKind::TrafficAudit,
        format!("{} established connection(s) inspected", inspected),
    )
}
