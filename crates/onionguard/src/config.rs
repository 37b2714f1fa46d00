//! onionguard configuration
//!
//! Configuration file: ~/.config/onionguard/config.yaml
//!
//! Every field has a default, so an empty or missing file yields a working
//! setup for a stock Tor install (SOCKS on 9050, DNSPort on 5353).
//! The configuration is read once at startup and never reloaded.

use crate::error::GuardError;
use crate::probe::ProbeKind;
use anyhow::{Context, Result};
use onionguard_core::Paths;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supplies the configuration at startup
pub trait ConfigSource {
    fn load(&self) -> Result<GuardConfig>;
}

/// Reads YAML from a file, falling back to defaults when it does not exist
pub struct YamlConfigSource {
    path: PathBuf,
}

impl YamlConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Source at the default location
    pub fn default_location() -> Self {
        Self::new(Paths::new().config_file())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for YamlConfigSource {
    fn load(&self) -> Result<GuardConfig> {
        let config = GuardConfig::load_from(&self.path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Per-probe scheduling and failure policy
    #[serde(default)]
    pub probes: ProbeSettings,

    /// Interval stretching and jitter
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Where the anonymizing proxy listens
    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub identity: IdentityConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    /// How the network is severed
    #[serde(default)]
    pub cutoff: CutoffConfig,

    #[serde(default)]
    pub reporting: ReportingConfig,
}

impl GuardConfig {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Self = serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the engine cannot honor
    pub fn validate(&self) -> Result<(), GuardError> {
        for kind in ProbeKind::ALL {
            let probe = self.probes.get(kind);
            if probe.failure_threshold == 0 {
                return Err(GuardError::Config(format!(
                    "{}: failure_threshold must be at least 1",
                    kind
                )));
            }
            if probe.interval_secs == 0 {
                return Err(GuardError::Config(format!("{}: interval_secs must be positive", kind)));
            }
            if probe.timeout_secs == 0 {
                return Err(GuardError::Config(format!("{}: timeout_secs must be positive", kind)));
            }
        }

        if self.cutoff.max_attempts == 0 {
            return Err(GuardError::Config("cutoff.max_attempts must be at least 1".to_string()));
        }
        if self.cutoff.timeout_secs == 0 {
            return Err(GuardError::Config("cutoff.timeout_secs must be positive".to_string()));
        }
        if self.cutoff.backend == CutoffBackend::Command && self.cutoff.apply_commands.is_empty() {
            return Err(GuardError::Config(
                "cutoff.backend is 'command' but cutoff.apply_commands is empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.schedule.cpu_threshold) {
            return Err(GuardError::Config("schedule.cpu_threshold must be within 0.0..=1.0".to_string()));
        }
        if self.identity.check_urls.is_empty() {
            return Err(GuardError::Config("identity.check_urls must not be empty".to_string()));
        }

        Ok(())
    }

    /// Journal location, honoring an explicit override
    pub fn journal_path(&self) -> PathBuf {
        self.reporting
            .journal_path
            .clone()
            .unwrap_or_else(|| Paths::new().journal())
    }
}

/// Scheduling and failure policy of one probe kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeConfig {
    /// Seconds between two runs
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Wall-clock bound on one run, retries included
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures that make the host compromised
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Attempts per network operation inside one run
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

fn default_interval() -> u64 {
    30
}

fn default_timeout() -> u64 {
    20
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    5
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            timeout_secs: default_timeout(),
            failure_threshold: default_failure_threshold(),
            retries: default_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

impl ProbeConfig {
    pub fn new(interval_secs: u64, timeout_secs: u64, failure_threshold: u32) -> Self {
        Self {
            interval_secs,
            timeout_secs,
            failure_threshold,
            ..Default::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Probe policy for every kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeSettings {
    #[serde(default = "default_proxy_status")]
    pub proxy_status: ProbeConfig,

    #[serde(default = "default_dns_leak")]
    pub dns_leak: ProbeConfig,

    #[serde(default = "default_ip_identity")]
    pub ip_identity: ProbeConfig,

    #[serde(default = "default_traffic_audit")]
    pub traffic_audit: ProbeConfig,
}

fn default_proxy_status() -> ProbeConfig {
    ProbeConfig::new(30, 10, 3)
}

fn default_dns_leak() -> ProbeConfig {
    ProbeConfig::new(30, 20, 3)
}

fn default_ip_identity() -> ProbeConfig {
    ProbeConfig::new(60, 45, 2)
}

fn default_traffic_audit() -> ProbeConfig {
    ProbeConfig::new(15, 10, 3)
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            proxy_status: default_proxy_status(),
            dns_leak: default_dns_leak(),
            ip_identity: default_ip_identity(),
            traffic_audit: default_traffic_audit(),
        }
    }
}

impl ProbeSettings {
    /// The same policy for every kind
    pub fn uniform(config: ProbeConfig) -> Self {
        Self {
            proxy_status: config.clone(),
            dns_leak: config.clone(),
            ip_identity: config.clone(),
            traffic_audit: config,
        }
    }

    pub fn get(&self, kind: ProbeKind) -> &ProbeConfig {
        match kind {
            ProbeKind::ProxyStatus => &self.proxy_status,
            ProbeKind::DnsLeak => &self.dns_leak,
            ProbeKind::IpIdentity => &self.ip_identity,
            ProbeKind::TrafficAudit => &self.traffic_audit,
        }
    }

    pub fn get_mut(&mut self, kind: ProbeKind) -> &mut ProbeConfig {
        match kind {
            ProbeKind::ProxyStatus => &mut self.proxy_status,
            ProbeKind::DnsLeak => &mut self.dns_leak,
            ProbeKind::IpIdentity => &mut self.ip_identity,
            ProbeKind::TrafficAudit => &mut self.traffic_audit,
        }
    }
}

/// Interval stretching under load, plus jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    /// Stretch intervals when the CPU is busy
    #[serde(default = "default_true")]
    pub adaptive: bool,

    /// Load fraction above which intervals stretch
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,

    /// Upper bound of a stretched interval
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    /// Maximum random delay added to each wait
    #[serde(default = "default_jitter")]
    pub jitter_secs: f64,
}

fn default_true() -> bool {
    true
}

fn default_cpu_threshold() -> f64 {
    0.8
}

fn default_max_interval() -> u64 {
    120
}

fn default_jitter() -> f64 {
    5.0
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            adaptive: true,
            cpu_threshold: default_cpu_threshold(),
            max_interval_secs: default_max_interval(),
            jitter_secs: default_jitter(),
        }
    }
}

impl ScheduleConfig {
    /// Fixed intervals, no jitter
    pub fn fixed() -> Self {
        Self {
            adaptive: false,
            jitter_secs: 0.0,
            ..Default::default()
        }
    }
}

/// Anonymizing proxy endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// SOCKS5 listener
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,

    /// Control port, checked with PROTOCOLINFO when set
    #[serde(default)]
    pub control_addr: Option<String>,

    /// DNSPort of the proxy
    #[serde(default = "default_dns_addr")]
    pub dns_addr: String,

    /// Process that must be alive, when set
    #[serde(default = "default_process_name")]
    pub process_name: Option<String>,
}

fn default_socks_addr() -> String {
    "127.0.0.1:9050".to_string()
}

fn default_dns_addr() -> String {
    "127.0.0.1:5353".to_string()
}

fn default_process_name() -> Option<String> {
    Some("tor".to_string())
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socks_addr: default_socks_addr(),
            control_addr: None,
            dns_addr: default_dns_addr(),
            process_name: default_process_name(),
        }
    }
}

impl ProxyConfig {
    /// Proxy URL for HTTP clients; `socks5h` keeps name resolution on the proxy
    pub fn socks_url(&self) -> String {
        format!("socks5h://{}", self.socks_addr)
    }
}

/// DNS leak detection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsConfig {
    /// Names resolved through the proxy on every run
    #[serde(default = "default_test_domains")]
    pub test_domains: Vec<String>,

    /// Host resolver configuration to inspect
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: PathBuf,

    /// Nameservers known to route through the proxy, besides the proxy's
    /// own DNS host; loopback stubs such as 127.0.0.53 are not implied
    #[serde(default)]
    pub allowed_resolvers: Vec<IpAddr>,

    /// Expected answers; empty disables the comparison
    #[serde(default)]
    pub baseline: Vec<IpAddr>,

    #[serde(default = "default_dig_binary")]
    pub dig_binary: String,
}

fn default_test_domains() -> Vec<String> {
    vec!["check.torproject.org".to_string()]
}

fn default_resolv_conf() -> PathBuf {
    PathBuf::from("/etc/resolv.conf")
}

fn default_dig_binary() -> String {
    "dig".to_string()
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            test_domains: default_test_domains(),
            resolv_conf: default_resolv_conf(),
            allowed_resolvers: Vec::new(),
            baseline: Vec::new(),
            dig_binary: default_dig_binary(),
        }
    }
}

/// Exit identity verification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityConfig {
    /// Tor check endpoints, tried in order
    #[serde(default = "default_check_urls")]
    pub check_urls: Vec<String>,

    /// Plain-text public IP echo service
    #[serde(default = "default_ip_echo_url")]
    pub ip_echo_url: String,

    /// Compare against the direct (unproxied) public IP
    #[serde(default = "default_true")]
    pub direct_check: bool,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_check_urls() -> Vec<String> {
    vec![
        "https://check.torproject.org/api/ip".to_string(),
        "https://api.onionoo.torproject.org/details?type=client".to_string(),
    ]
}

fn default_ip_echo_url() -> String {
    "https://api.ipify.org".to_string()
}

fn default_user_agent() -> String {
    "curl/7.68.0".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            check_urls: default_check_urls(),
            ip_echo_url: default_ip_echo_url(),
            direct_check: true,
            user_agent: default_user_agent(),
        }
    }
}

/// Connection audit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficConfig {
    /// Processes allowed to talk to the outside world
    #[serde(default = "default_proxy_processes")]
    pub proxy_processes: Vec<String>,

    /// Ports that may listen on non-loopback addresses
    #[serde(default = "default_allowed_listen_ports")]
    pub allowed_listen_ports: Vec<u16>,

    #[serde(default = "default_ss_binary")]
    pub ss_binary: String,
}

fn default_proxy_processes() -> Vec<String> {
    vec!["tor".to_string()]
}

fn default_allowed_listen_ports() -> Vec<u16> {
    vec![9050, 9051, 5353]
}

fn default_ss_binary() -> String {
    "ss".to_string()
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            proxy_processes: default_proxy_processes(),
            allowed_listen_ports: default_allowed_listen_ports(),
            ss_binary: default_ss_binary(),
        }
    }
}

/// Network cutoff mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CutoffBackend {
    /// iptables + ip6tables DROP policies
    #[default]
    Iptables,
    /// User-supplied shell commands
    Command,
    /// Log only, never touch the firewall
    DryRun,
}

impl CutoffBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            CutoffBackend::Iptables => "iptables",
            CutoffBackend::Command => "command",
            CutoffBackend::DryRun => "dryrun",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CutoffConfig {
    #[serde(default)]
    pub backend: CutoffBackend,

    /// Local user the proxy runs as; its traffic stays allowed while engaged
    #[serde(default = "default_proxy_user")]
    pub proxy_user: Option<String>,

    /// Commands run by the `command` backend to cut the network
    #[serde(default)]
    pub apply_commands: Vec<String>,

    /// Commands run by the `command` backend to restore the network
    #[serde(default)]
    pub revert_commands: Vec<String>,

    /// Bound on one apply/revert attempt
    #[serde(default = "default_cutoff_timeout")]
    pub timeout_secs: u64,

    /// Attempts before the failure is declared unresolved
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First retry delay, doubled on each attempt
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
}

fn default_proxy_user() -> Option<String> {
    Some("debian-tor".to_string())
}

fn default_cutoff_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff() -> u64 {
    1
}

impl Default for CutoffConfig {
    fn default() -> Self {
        Self {
            backend: CutoffBackend::default(),
            proxy_user: default_proxy_user(),
            apply_commands: Vec::new(),
            revert_commands: Vec::new(),
            timeout_secs: default_cutoff_timeout(),
            max_attempts: default_max_attempts(),
            backoff_secs: default_backoff(),
        }
    }
}

impl CutoffConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_secs(self.backoff_secs)
    }
}

/// Output sinks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportingConfig {
    /// Append every event to the JSON-lines journal
    #[serde(default = "default_true")]
    pub journal: bool,

    #[serde(default)]
    pub journal_path: Option<PathBuf>,

    /// Raise desktop notifications on compromise
    #[serde(default = "default_true")]
    pub desktop: bool,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            journal: true,
            journal_path: None,
            desktop: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GuardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.proxy.socks_addr, "127.0.0.1:9050");
        assert_eq!(config.proxy.socks_url(), "socks5h://127.0.0.1:9050");
        assert_eq!(config.probes.get(ProbeKind::IpIdentity).failure_threshold, 2);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
probes:
  dns_leak:
    interval_secs: 10
    failure_threshold: 5
cutoff:
  backend: dryrun
"#;
        let config: GuardConfig = serde_yaml::from_str(yaml).unwrap();
        let dns = config.probes.get(ProbeKind::DnsLeak);
        assert_eq!(dns.interval_secs, 10);
        assert_eq!(dns.failure_threshold, 5);
        assert_eq!(dns.timeout_secs, 20);
        assert_eq!(config.probes.proxy_status, ProbeConfig::new(30, 10, 3));
        assert_eq!(config.cutoff.backend, CutoffBackend::DryRun);
        assert_eq!(config.dns.test_domains, vec!["check.torproject.org".to_string()]);
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = GuardConfig::default();
        config.probes.get_mut(ProbeKind::TrafficAudit).failure_threshold = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("traffic_audit"));
    }

    #[test]
    fn test_command_backend_needs_commands() {
        let mut config = GuardConfig::default();
        config.cutoff.backend = CutoffBackend::Command;
        assert!(config.validate().is_err());
        config.cutoff.apply_commands = vec!["nft add table inet guard".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let source = YamlConfigSource::new(dir.path().join("absent.yaml"));
        let config = source.load().unwrap();
        assert_eq!(config.probes, ProbeSettings::default());
    }

    #[test]
    fn test_yaml_source_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "probes:\n  proxy_status:\n    timeout_secs: 0\n").unwrap();
        assert!(YamlConfigSource::new(path).load().is_err());
    }
}
