//! DNS leak detection
//!
//! Two signals: the host resolver configuration (any nameserver other than
//! the proxy's DNS host or an allowed resolver sends lookups around the
//! proxy, local stub resolvers included) and an actual lookup through the
//! proxy's DNSPort, optionally compared against a known baseline.

use super::{with_retries, ProbeKind, ProbeResult, Severity};
use crate::config::DnsConfig;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

pub struct DnsLeakProbe {
    config: DnsConfig,
    proxy_dns: String,
    retries: u32,
    retry_delay: Duration,
}

impl DnsLeakProbe {
    pub fn new(config: DnsConfig, proxy_dns: String, retries: u32, retry_delay: Duration) -> Self {
        Self {
            config,
            proxy_dns,
            retries,
            retry_delay,
        }
    }

    pub async fn check(&self) -> ProbeResult {
        let resolv = match tokio::fs::read_to_string(&self.config.resolv_conf).await {
            Ok(content) => content,
            Err(e) => {
                return ProbeResult::fault(
                    ProbeKind::DnsLeak,
                    format!("cannot read {}: {}", self.config.resolv_conf.display(), e),
                )
            }
        };

        let server: SocketAddr = match self.proxy_dns.parse() {
            Ok(addr) => addr,
            Err(e) => return ProbeResult::fault(ProbeKind::DnsLeak, format!("bad DNS address '{}': {}", self.proxy_dns, e)),
        };

        let mut allowed = self.config.allowed_resolvers.clone();
        allowed.push(server.ip());
        let bypassing = bypassing_resolvers(&parse_nameservers(&resolv), &allowed);
        if !bypassing.is_empty() {
            let list: Vec<String> = bypassing.iter().map(|ip| ip.to_string()).collect();
            return ProbeResult::fail(
                ProbeKind::DnsLeak,
                Severity::Critical,
                format!("system resolver bypasses the proxy: {}", list.join(", ")),
            );
        }

        for domain in &self.config.test_domains {
            let answers = with_retries(self.retries, self.retry_delay, || {
                resolve_via(&self.config.dig_binary, server, domain)
            })
            .await;

            let answers = match answers {
                Ok(answers) => answers,
                Err(e) => return ProbeResult::fault(ProbeKind::DnsLeak, format!("{}: {}", domain, e)),
            };

            if answers.is_empty() {
                return ProbeResult::fault(ProbeKind::DnsLeak, format!("{}: no answer through the proxy resolver", domain));
            }

            if !matches_baseline(&answers, &self.config.baseline) {
                let list: Vec<String> = answers.iter().map(|ip| ip.to_string()).collect();
                return ProbeResult::fail(
                    ProbeKind::DnsLeak,
                    Severity::Critical,
                    format!("{} resolved to {} which is outside the expected baseline", domain, list.join(", ")),
                );
            }

            debug!("{} resolved through {} to {:?}", domain, server, answers);
        }

        ProbeResult::pass(
            ProbeKind::DnsLeak,
            format!("{} domain(s) resolved through {}", self.config.test_domains.len(), server),
        )
    }
}

/// `nameserver` entries of a resolv.conf
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => {
                    // Strip IPv6 zone ids (fe80::1%eth0)
                    let addr = addr.split('%').next().unwrap_or(addr);
                    addr.parse().ok()
                }
                _ => None,
            }
        })
        .collect()
}

/// Nameservers that are not explicitly allowed
pub fn bypassing_resolvers(nameservers: &[IpAddr], allowed: &[IpAddr]) -> Vec<IpAddr> {
    nameservers
        .iter()
        .filter(|ip| !allowed.contains(ip))
        .copied()
        .collect()
}

/// An empty baseline accepts anything; otherwise one answer must be in it
pub fn matches_baseline(answers: &[IpAddr], baseline: &[IpAddr]) -> bool {
    baseline.is_empty() || answers.iter().any(|ip| baseline.contains(ip))
}

/// Address records from `dig +short` output; CNAME lines are skipped
pub fn parse_dig_answers(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}

async fn resolve_via(dig: &str, server: SocketAddr, domain: &str) -> Result<Vec<IpAddr>, String> {
    let output = Command::new(dig)
        .arg("+short")
        .arg("+tries=1")
        .arg(format!("@{}", server.ip()))
        .args(["-p", &server.port().to_string()])
        .arg(domain)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| format!("failed to run {}: {}", dig, e))?;

    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .unwrap_or("no output")
            .to_string();
        return Err(format!("{} exited with {}: {}", dig, output.status, reason));
    }

    Ok(parse_dig_answers(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const RESOLV: &str = "\
# Generated by NetworkManager
search lan
nameserver 127.0.0.1
nameserver 192.168.1.1
; comment
nameserver fe80::1%eth0
options edns0
";

    fn probe(resolv_conf: &Path, dig: &str) -> DnsLeakProbe {
        let config = DnsConfig {
            resolv_conf: resolv_conf.to_path_buf(),
            dig_binary: dig.to_string(),
            ..Default::default()
        };
        DnsLeakProbe::new(config, "127.0.0.1:5353".to_string(), 1, Duration::ZERO)
    }

    #[test]
    fn test_parse_nameservers() {
        let servers = parse_nameservers(RESOLV);
        assert_eq!(
            servers,
            vec![
                "127.0.0.1".parse::<IpAddr>().unwrap(),
                "192.168.1.1".parse().unwrap(),
                "fe80::1".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn test_only_allowed_resolvers_do_not_bypass() {
        let servers = parse_nameservers(RESOLV);
        let allowed = vec!["127.0.0.1".parse().unwrap(), "192.168.1.1".parse().unwrap()];
        let bypassing = bypassing_resolvers(&servers, &allowed);
        assert_eq!(bypassing, vec!["fe80::1".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn test_loopback_stub_resolver_bypasses() {
        let servers = parse_nameservers("nameserver 127.0.0.53\noptions edns0 trust-ad\n");
        let allowed = vec!["127.0.0.1".parse().unwrap()];
        assert_eq!(bypassing_resolvers(&servers, &allowed), servers);
    }

    #[tokio::test]
    async fn test_systemd_stub_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 127.0.0.53\n").unwrap();

        let result = probe(&path, "false").check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("127.0.0.53"));
    }

    #[test]
    fn test_dig_output_skips_cnames() {
        let answers = parse_dig_answers("check.torproject.org.cdn.\n116.202.120.181\n2a01:4f8::1\n");
        assert_eq!(answers.len(), 2);
    }

    #[test]
    fn test_baseline() {
        let answers = vec!["116.202.120.181".parse().unwrap()];
        assert!(matches_baseline(&answers, &[]));
        assert!(matches_baseline(&answers, &answers));
        assert!(!matches_baseline(&answers, &["10.0.0.1".parse().unwrap()]));
    }

    #[tokio::test]
    async fn test_direct_resolver_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 8.8.8.8\n").unwrap();

        let result = probe(&path, "dig").check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("8.8.8.8"));
    }

    #[tokio::test]
    async fn test_failed_lookup_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 127.0.0.1\n").unwrap();

        // `false` ignores its arguments and exits 1
        let result = probe(&path, "false").check().await;
        assert!(!result.ok());
        assert_eq!(result.severity(), Severity::Warning);
    }

    #[tokio::test]
    async fn test_unreadable_resolver_config_is_a_warning() {
        let result = probe(Path::new("/nonexistent/resolv.conf"), "dig").check().await;
        assert!(!result.ok());
        assert_eq!(result.severity(), Severity::Warning);
    }
}
