//! Probes and their results
//!
//! A probe reads external signals (sockets, resolver config, HTTP endpoints,
//! the connection table) and turns them into exactly one `ProbeResult`.
//! Probes never touch evaluator or kill switch state.
//!
//! Severity policy: only direct leak evidence is critical (proxy down, DNS
//! bypassing the proxy, traffic outside the proxy, exit identity equal to the
//! host's). Measurement trouble and ambiguous answers are warnings.

mod dns;
mod identity;
mod proxy;
mod traffic;

pub use dns::DnsLeakProbe;
pub use identity::IpIdentityProbe;
pub use proxy::ProxyStatusProbe;
pub use traffic::TrafficAuditProbe;

use crate::config::GuardConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// The closed set of checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    ProxyStatus,
    DnsLeak,
    IpIdentity,
    TrafficAudit,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::ProxyStatus,
        ProbeKind::DnsLeak,
        ProbeKind::IpIdentity,
        ProbeKind::TrafficAudit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::ProxyStatus => "proxy_status",
            ProbeKind::DnsLeak => "dns_leak",
            ProbeKind::IpIdentity => "ip_identity",
            ProbeKind::TrafficAudit => "traffic_audit",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "proxy_status" | "proxy" => Some(ProbeKind::ProxyStatus),
            "dns_leak" | "dns" => Some(ProbeKind::DnsLeak),
            "ip_identity" | "ip" => Some(ProbeKind::IpIdentity),
            "traffic_audit" | "traffic" => Some(ProbeKind::TrafficAudit),
            _ => None,
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How bad a negative result is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict of one probe run
///
/// Fields are private: a result is immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    kind: ProbeKind,
    ok: bool,
    severity: Severity,
    observed_at: DateTime<Utc>,
    detail: String,
}

pub const TIMEOUT_DETAIL: &str = "timeout";

impl ProbeResult {
    pub fn new(kind: ProbeKind, ok: bool, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            ok,
            severity,
            observed_at: Utc::now(),
            detail: detail.into(),
        }
    }

    /// A passing result
    pub fn pass(kind: ProbeKind, detail: impl Into<String>) -> Self {
        Self::new(kind, true, Severity::Info, detail)
    }

    /// A failing result
    pub fn fail(kind: ProbeKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self::new(kind, false, severity, detail)
    }

    /// The run did not finish within its bound
    pub fn timeout(kind: ProbeKind) -> Self {
        Self::fail(kind, Severity::Warning, TIMEOUT_DETAIL)
    }

    /// The measurement itself broke (network error, malformed response, panic)
    pub fn fault(kind: ProbeKind, fault: impl fmt::Display) -> Self {
        Self::fail(kind, Severity::Warning, fault.to_string())
    }

    pub fn kind(&self) -> ProbeKind {
        self.kind
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn is_timeout(&self) -> bool {
        !self.ok && self.detail == TIMEOUT_DETAIL
    }

    /// Direct evidence of a leak
    pub fn is_critical_failure(&self) -> bool {
        !self.ok && self.severity == Severity::Critical
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.ok { "ok" } else { "FAIL" };
        write!(f, "{} {} [{}]", self.kind, verdict, self.severity)?;
        if !self.detail.is_empty() {
            write!(f, ": {}", self.detail)?;
        }
        Ok(())
    }
}

/// Capability to run one check
#[async_trait]
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    /// Perform the check. May take arbitrarily long; callers go through `run`.
    async fn check(&self) -> ProbeResult;

    /// Perform the check within `timeout`
    async fn run(&self, timeout: Duration) -> ProbeResult {
        match tokio::time::timeout(timeout, self.check()).await {
            Ok(result) => result,
            Err(_) => {
                debug!(probe = %self.kind(), "probe timed out after {:?}", timeout);
                ProbeResult::timeout(self.kind())
            }
        }
    }
}

/// The four standard probes behind one dispatch point
pub enum StandardProbe {
    ProxyStatus(ProxyStatusProbe),
    DnsLeak(DnsLeakProbe),
    IpIdentity(IpIdentityProbe),
    TrafficAudit(TrafficAuditProbe),
}

impl StandardProbe {
    pub fn build(kind: ProbeKind, config: &GuardConfig) -> Self {
        let policy = config.probes.get(kind);
        match kind {
            ProbeKind::ProxyStatus => StandardProbe::ProxyStatus(ProxyStatusProbe::new(config.proxy.clone())),
            ProbeKind::DnsLeak => StandardProbe::DnsLeak(DnsLeakProbe::new(
                config.dns.clone(),
                config.proxy.dns_addr.clone(),
                policy.retries,
                policy.retry_delay(),
            )),
            ProbeKind::IpIdentity => StandardProbe::IpIdentity(IpIdentityProbe::new(
                config.identity.clone(),
                config.proxy.socks_url(),
                policy.retries,
                policy.retry_delay(),
            )),
            ProbeKind::TrafficAudit => StandardProbe::TrafficAudit(TrafficAuditProbe::new(config.traffic.clone())),
        }
    }
}

#[async_trait]
impl Probe for StandardProbe {
    fn kind(&self) -> ProbeKind {
        match self {
            StandardProbe::ProxyStatus(_) => ProbeKind::ProxyStatus,
            StandardProbe::DnsLeak(_) => ProbeKind::DnsLeak,
            StandardProbe::IpIdentity(_) => ProbeKind::IpIdentity,
            StandardProbe::TrafficAudit(_) => ProbeKind::TrafficAudit,
        }
    }

    async fn check(&self) -> ProbeResult {
        match self {
            StandardProbe::ProxyStatus(p) => p.check().await,
            StandardProbe::DnsLeak(p) => p.check().await,
            StandardProbe::IpIdentity(p) => p.check().await,
            StandardProbe::TrafficAudit(p) => p.check().await,
        }
    }
}

/// One probe per kind, built from the configuration
pub fn standard_probes(config: &GuardConfig) -> Vec<Arc<dyn Probe>> {
    ProbeKind::ALL
        .iter()
        .map(|kind| Arc::new(StandardProbe::build(*kind, config)) as Arc<dyn Probe>)
        .collect()
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures
pub(crate) async fn with_retries<T, E, F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!("attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SlowProbe;

    #[async_trait]
    impl Probe for SlowProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::TrafficAudit
        }

        async fn check(&self) -> ProbeResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ProbeResult::pass(ProbeKind::TrafficAudit, "")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_is_bounded_by_timeout() {
        let result = SlowProbe.run(Duration::from_secs(5)).await;
        assert!(!result.ok());
        assert_eq!(result.severity(), Severity::Warning);
        assert_eq!(result.detail(), "timeout");
        assert!(result.is_timeout());
        assert_eq!(result.kind(), ProbeKind::TrafficAudit);
    }

    #[test]
    fn test_kind_parsing() {
        for kind in ProbeKind::ALL {
            assert_eq!(ProbeKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(ProbeKind::from_str("DNS"), Some(ProbeKind::DnsLeak));
        assert_eq!(ProbeKind::from_str("bogus"), None);
    }

    #[test]
    fn test_critical_failure_classification() {
        assert!(ProbeResult::fail(ProbeKind::DnsLeak, Severity::Critical, "leak").is_critical_failure());
        assert!(!ProbeResult::fail(ProbeKind::DnsLeak, Severity::Warning, "slow").is_critical_failure());
        assert!(!ProbeResult::new(ProbeKind::DnsLeak, true, Severity::Critical, "").is_critical_failure());
    }

    #[test]
    fn test_result_serializes_kind_in_snake_case() {
        let result = ProbeResult::fail(ProbeKind::IpIdentity, Severity::Critical, "same ip");
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"ip_identity\""));
        assert!(json.contains("\"critical\""));
        let back: ProbeResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let value: Result<u32, String> = with_retries(3, Duration::from_secs(5), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {}", n))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(value, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_give_up() {
        let calls = AtomicU32::new(0);
        let value: Result<(), String> = with_retries(2, Duration::from_secs(1), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert!(value.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
