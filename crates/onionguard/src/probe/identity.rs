//! Exit identity verification
//!
//! Asks a Tor check endpoint, through the proxy, whether the request left
//! the network from a Tor exit, and compares the apparent address with the
//! host's direct public address when that comparison is possible.

use super::{with_retries, ProbeKind, ProbeResult, Severity};
use crate::config::IdentityConfig;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What a check endpoint told us
#[derive(Debug, Clone, PartialEq)]
pub struct TorCheck {
    pub is_tor: bool,
    pub ip: Option<IpAddr>,
}

pub struct IpIdentityProbe {
    config: IdentityConfig,
    socks_url: String,
    retries: u32,
    retry_delay: Duration,
}

impl IpIdentityProbe {
    pub fn new(config: IdentityConfig, socks_url: String, retries: u32, retry_delay: Duration) -> Self {
        Self {
            config,
            socks_url,
            retries,
            retry_delay,
        }
    }

    pub async fn check(&self) -> ProbeResult {
        let proxied = match self.client(true) {
            Ok(client) => client,
            Err(e) => return ProbeResult::fault(ProbeKind::IpIdentity, format!("cannot build proxied client: {}", e)),
        };

        let verdict = match self.tor_verdict(&proxied).await {
            Ok(verdict) => verdict,
            Err(e) => return ProbeResult::fault(ProbeKind::IpIdentity, e),
        };

        let mut proxy_ip = verdict.as_ref().and_then(|v| v.ip);
        let direct_ip = if self.config.direct_check {
            if proxy_ip.is_none() {
                proxy_ip = self.fetch_ip(&proxied).await.ok();
            }
            match self.client(false) {
                Ok(direct) => match self.fetch_ip(&direct).await {
                    Ok(ip) => Some(ip),
                    Err(e) => {
                        debug!("direct path unavailable, verifying through the proxy only: {}", e);
                        None
                    }
                },
                Err(_) => None,
            }
        } else {
            None
        };

        classify(verdict.map(|v| v.is_tor), proxy_ip, direct_ip)
    }

    fn client(&self, proxied: bool) -> Result<reqwest::Client, reqwest::Error> {
        let builder = reqwest::Client::builder()
            .user_agent(self.config.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT);
        let builder = if proxied {
            builder.proxy(reqwest::Proxy::all(&self.socks_url)?)
        } else {
            builder.no_proxy()
        };
        builder.build()
    }

    /// First endpoint that yields a verdict wins; `Ok(None)` when none could tell
    async fn tor_verdict(&self, client: &reqwest::Client) -> Result<Option<TorCheck>, String> {
        let mut last_error = None;
        let mut answered = false;

        for url in &self.config.check_urls {
            let body = with_retries(self.retries, self.retry_delay, || async {
                let response = client.get(url.as_str()).send().await.map_err(|e| e.to_string())?;
                response.json::<Value>().await.map_err(|e| e.to_string())
            })
            .await;

            match body {
                Ok(body) => {
                    answered = true;
                    if let Some(verdict) = parse_tor_check(&body) {
                        return Ok(Some(verdict));
                    }
                    debug!("{} gave no Tor verdict", url);
                }
                Err(e) => last_error = Some(format!("{}: {}", url, e)),
            }
        }

        match (answered, last_error) {
            (false, Some(e)) => Err(format!("all check endpoints failed, last error {}", e)),
            _ => Ok(None),
        }
    }

    async fn fetch_ip(&self, client: &reqwest::Client) -> Result<IpAddr, String> {
        with_retries(self.retries, self.retry_delay, || async {
            let body = client
                .get(self.config.ip_echo_url.as_str())
                .send()
                .await
                .map_err(|e| e.to_string())?
                .text()
                .await
                .map_err(|e| e.to_string())?;
            body.trim()
                .parse::<IpAddr>()
                .map_err(|_| format!("'{}' is not an address", body.trim()))
        })
        .await
    }
}

/// Understands check.torproject.org (`IsTor`, `IP`) and onionoo (`clients`)
pub fn parse_tor_check(body: &Value) -> Option<TorCheck> {
    if let Some(is_tor) = body.get("IsTor").and_then(Value::as_bool) {
        let ip = body.get("IP").and_then(Value::as_str).and_then(|s| s.parse().ok());
        return Some(TorCheck { is_tor, ip });
    }

    body.get("clients").map(|clients| TorCheck {
        is_tor: clients.as_array().map(|c| !c.is_empty()).unwrap_or(false),
        ip: None,
    })
}

/// Combine the endpoint verdict with the address comparison
pub fn classify(is_tor: Option<bool>, proxy_ip: Option<IpAddr>, direct_ip: Option<IpAddr>) -> ProbeResult {
    if is_tor == Some(false) {
        let seen = proxy_ip.map(|ip| format!(" (seen as {})", ip)).unwrap_or_default();
        return ProbeResult::fail(
            ProbeKind::IpIdentity,
            Severity::Critical,
            format!("traffic through the proxy does not exit via Tor{}", seen),
        );
    }

    match (proxy_ip, direct_ip) {
        (Some(proxy), Some(direct)) if proxy == direct => ProbeResult::fail(
            ProbeKind::IpIdentity,
            Severity::Critical,
            format!("proxy exit address equals the direct address {}", direct),
        ),
        (Some(proxy), Some(_)) => ProbeResult::pass(ProbeKind::IpIdentity, format!("exit address {} differs from host", proxy)),
        _ => match is_tor {
            Some(true) => ProbeResult::pass(ProbeKind::IpIdentity, "Tor exit confirmed (proxy path only)"),
            _ => ProbeResult::fail(
                ProbeKind::IpIdentity,
                Severity::Warning,
                "exit identity could not be determined",
            ),
        },
    }
}
