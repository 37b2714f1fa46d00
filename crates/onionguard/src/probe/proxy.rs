//! Proxy liveness
//!
//! The SOCKS listener must complete a SOCKS5 no-auth greeting, the control
//! port (when configured) must answer PROTOCOLINFO, and the proxy process
//! (when configured) must be alive. Anything else means no anonymity layer.

use super::{ProbeKind, ProbeResult, Severity};
use crate::config::ProxyConfig;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;

pub struct ProxyStatusProbe {
    config: ProxyConfig,
}

impl ProxyStatusProbe {
    pub fn new(config: ProxyConfig) -> Self {
        Self { config }
    }

    pub async fn check(&self) -> ProbeResult {
        if let Some(name) = &self.config.process_name {
            let lookup = name.clone();
            let running = tokio::task::spawn_blocking(move || onionguard_core::process::is_running(&lookup)).await;
            if let Some(failed) = process_verdict(name, running) {
                return failed;
            }
        }

        if let Err(e) = socks_greeting(&self.config.socks_addr).await {
            return critical(format!("SOCKS listener {}: {}", self.config.socks_addr, e));
        }

        if let Some(control) = &self.config.control_addr {
            if let Err(e) = control_protocolinfo(control).await {
                return critical(format!("control port {}: {}", control, e));
            }
        }

        ProbeResult::pass(ProbeKind::ProxyStatus, format!("proxy answering on {}", self.config.socks_addr))
    }
}

/// A dead proxy is critical; a lookup that could not finish is only a fault
fn process_verdict(name: &str, lookup: Result<bool, tokio::task::JoinError>) -> Option<ProbeResult> {
    match lookup {
        Ok(true) => None,
        Ok(false) => Some(critical(format!("proxy process '{}' is not running", name))),
        Err(e) => Some(ProbeResult::fault(
            ProbeKind::ProxyStatus,
            format!("process lookup for '{}' failed: {}", name, e),
        )),
    }
}

fn critical(detail: String) -> ProbeResult {
    ProbeResult::fail(ProbeKind::ProxyStatus, Severity::Critical, detail)
}

/// Offer no-auth and expect the server to pick it
async fn socks_greeting(addr: &str) -> Result<(), String> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("unreachable ({})", e))?;

    stream
        .write_all(&[SOCKS_VERSION, 0x01, NO_AUTH])
        .await
        .map_err(|e| format!("greeting not accepted ({})", e))?;

    let mut reply = [0u8; 2];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(|e| format!("no greeting reply ({})", e))?;

    debug!("SOCKS greeting reply from {}: {:02x?}", addr, reply);

    match reply {
        [SOCKS_VERSION, NO_AUTH] => Ok(()),
        [SOCKS_VERSION, method] => Err(format!("refused no-auth (method {:#04x})", method)),
        [version, _] => Err(format!("not a SOCKS5 server (version {:#04x})", version)),
    }
}

/// PROTOCOLINFO is answered before authentication
async fn control_protocolinfo(addr: &str) -> Result<(), String> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| format!("unreachable ({})", e))?;
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(b"PROTOCOLINFO 1\r\n")
        .await
        .map_err(|e| format!("write failed ({})", e))?;

    let mut line = String::new();
    BufReader::new(read_half)
        .read_line(&mut line)
        .await
        .map_err(|e| format!("no reply ({})", e))?;

    if line.starts_with("250") {
        Ok(())
    } else {
        Err(format!("unexpected reply '{}'", line.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_process_lookup_verdicts() {
        assert!(process_verdict("tor", Ok(true)).is_none());

        let dead = process_verdict("tor", Ok(false)).unwrap();
        assert!(dead.is_critical_failure());

        let panicked = tokio::task::spawn_blocking(|| -> bool { panic!("sysinfo blew up") }).await;
        let fault = process_verdict("tor", panicked).unwrap();
        assert!(!fault.ok());
        assert_eq!(fault.severity(), Severity::Warning);
        assert!(fault.detail().contains("process lookup"));
    }

    async fn fake_socks(reply: [u8; 2]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&reply).await.unwrap();
        });
        addr
    }

    async fn closed_port() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        addr
    }

    fn config(socks_addr: String) -> ProxyConfig {
        ProxyConfig {
            socks_addr,
            control_addr: None,
            dns_addr: "127.0.0.1:5353".to_string(),
            process_name: None,
        }
    }

    #[tokio::test]
    async fn test_healthy_proxy_passes() {
        let addr = fake_socks([0x05, 0x00]).await;
        let result = ProxyStatusProbe::new(config(addr)).check().await;
        assert!(result.ok(), "{}", result);
    }

    #[tokio::test]
    async fn test_refused_auth_method_is_critical() {
        let addr = fake_socks([0x05, 0xff]).await;
        let result = ProxyStatusProbe::new(config(addr)).check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("refused no-auth"));
    }

    #[tokio::test]
    async fn test_unreachable_proxy_is_critical() {
        let addr = closed_port().await;
        let result = ProxyStatusProbe::new(config(addr)).check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("unreachable"));
    }

    #[tokio::test]
    async fn test_missing_process_is_critical() {
        let addr = fake_socks([0x05, 0x00]).await;
        let mut cfg = config(addr);
        cfg.process_name = Some("onionguard-no-such-proxy".to_string());
        let result = ProxyStatusProbe::new(cfg).check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("not running"));
    }

    #[tokio::test]
    async fn test_control_port_must_answer_250() {
        let socks = fake_socks([0x05, 0x00]).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let control = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"514 Authentication required.\r\n").await.unwrap();
        });

        let mut cfg = config(socks);
        cfg.control_addr = Some(control);
        let result = ProxyStatusProbe::new(cfg).check().await;
        assert!(result.is_critical_failure());
        assert!(result.detail().contains("514"));
    }
}
