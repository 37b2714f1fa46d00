//! Network cutoff mechanisms
//!
//! The kill switch decides when; a cutoff decides how:
//! - Iptables: DROP policies for IPv4 and IPv6, loopback and the proxy user exempt
//! - Command: operator-supplied shell commands
//! - DryRun: logs what would happen, never touches the host

use crate::config::{CutoffBackend, CutoffConfig};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Severs and restores host networking
#[async_trait]
pub trait NetworkCutoff: Send + Sync {
    fn name(&self) -> &str;

    /// Block all traffic that could leave outside the proxy
    async fn apply(&self) -> Result<()>;

    /// Lift the block
    async fn revert(&self) -> Result<()>;
}

/// Build the configured cutoff; `dry_run` overrides the backend
pub fn build_cutoff(config: &CutoffConfig, dry_run: bool) -> Box<dyn NetworkCutoff> {
    let backend = if dry_run { CutoffBackend::DryRun } else { config.backend };
    match backend {
        CutoffBackend::Iptables => {
            if !is_root() {
                warn!("not running as root: iptables cutoff will fail when needed");
            }
            Box::new(IptablesCutoff::new(config.proxy_user.clone()))
        }
        CutoffBackend::Command => Box::new(CommandCutoff::new(
            config.apply_commands.clone(),
            config.revert_commands.clone(),
        )),
        CutoffBackend::DryRun => Box::new(DryRunCutoff),
    }
}

pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

/// One iptables flavor
#[derive(Debug, Clone, Copy)]
struct Family {
    tool: &'static str,
    save: &'static str,
    restore: &'static str,
}

const FAMILIES: [Family; 2] = [
    Family {
        tool: "iptables",
        save: "iptables-save",
        restore: "iptables-restore",
    },
    Family {
        tool: "ip6tables",
        save: "ip6tables-save",
        restore: "ip6tables-restore",
    },
];

/// Arguments applied in order to each family
///
/// Policies go to DROP first so nothing slips through while the chains are
/// being rewritten.
pub fn cutoff_rules(proxy_user: Option<&str>) -> Vec<Vec<String>> {
    let mut rules: Vec<Vec<&str>> = vec![
        vec!["-P", "OUTPUT", "DROP"],
        vec!["-P", "INPUT", "DROP"],
        vec!["-P", "FORWARD", "DROP"],
        vec!["-F"],
        vec!["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"],
        vec!["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"],
    ];
    if let Some(user) = proxy_user {
        rules.push(vec!["-A", "OUTPUT", "-m", "owner", "--uid-owner", user, "-j", "ACCEPT"]);
        rules.push(vec![
            "-A",
            "INPUT",
            "-m",
            "conntrack",
            "--ctstate",
            "ESTABLISHED,RELATED",
            "-j",
            "ACCEPT",
        ]);
    }
    rules
        .into_iter()
        .map(|r| r.into_iter().map(String::from).collect())
        .collect()
}

/// Used on revert when no snapshot of the previous ruleset exists
pub fn open_rules() -> Vec<Vec<String>> {
    [
        vec!["-P", "INPUT", "ACCEPT"],
        vec!["-P", "OUTPUT", "ACCEPT"],
        vec!["-P", "FORWARD", "ACCEPT"],
        vec!["-F"],
    ]
    .into_iter()
    .map(|r| r.into_iter().map(String::from).collect())
    .collect()
}

pub struct IptablesCutoff {
    proxy_user: Option<String>,
    /// Ruleset captured before the first apply, per tool
    snapshots: Mutex<HashMap<&'static str, String>>,
}

impl IptablesCutoff {
    pub fn new(proxy_user: Option<String>) -> Self {
        Self {
            proxy_user,
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot(&self, tool: &'static str) -> Option<String> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(tool)
            .cloned()
    }

    async fn save(&self, family: Family) {
        if self.snapshot(family.tool).is_some() {
            return;
        }
        match run(family.save, &[]).await {
            Ok(rules) => {
                self.snapshots
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(family.tool, rules);
            }
            Err(e) => debug!("{} unavailable, revert will open the chains: {:#}", family.save, e),
        }
    }
}

#[async_trait]
impl NetworkCutoff for IptablesCutoff {
    fn name(&self) -> &str {
        "iptables"
    }

    async fn apply(&self) -> Result<()> {
        for family in FAMILIES {
            self.save(family).await;
            for rule in cutoff_rules(self.proxy_user.as_deref()) {
                let args: Vec<&str> = rule.iter().map(String::as_str).collect();
                run(family.tool, &args).await?;
            }
            info!("{} rules in place", family.tool);
        }
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        for family in FAMILIES {
            let snapshot = self.snapshot(family.tool);
            match snapshot {
                Some(rules) => restore(family.restore, &rules).await?,
                None => {
                    for rule in open_rules() {
                        let args: Vec<&str> = rule.iter().map(String::as_str).collect();
                        run(family.tool, &args).await?;
                    }
                }
            }
            self.snapshots
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(family.tool);
            info!("{} rules restored", family.tool);
        }
        Ok(())
    }
}

/// Shell commands run in order; the first failure aborts
pub struct CommandCutoff {
    apply: Vec<String>,
    revert: Vec<String>,
}

impl CommandCutoff {
    pub fn new(apply: Vec<String>, revert: Vec<String>) -> Self {
        Self { apply, revert }
    }

    async fn run_all(commands: &[String]) -> Result<()> {
        for command in commands {
            debug!("running: {}", command);
            run("sh", &["-c", command])
                .await
                .with_context(|| format!("command failed: {}", command))?;
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkCutoff for CommandCutoff {
    fn name(&self) -> &str {
        "command"
    }

    async fn apply(&self) -> Result<()> {
        Self::run_all(&self.apply).await
    }

    async fn revert(&self) -> Result<()> {
        Self::run_all(&self.revert).await
    }
}

pub struct DryRunCutoff;

#[async_trait]
impl NetworkCutoff for DryRunCutoff {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn apply(&self) -> Result<()> {
        warn!("dry run: network would be cut off now");
        Ok(())
    }

    async fn revert(&self) -> Result<()> {
        warn!("dry run: network would be restored now");
        Ok(())
    }
}

/// Run a program, returning stdout; a non-zero exit is an error
async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .with_context(|| format!("Failed to run {}", program))?;

    if !output.status.success() {
        bail!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn restore(program: &str, rules: &str) -> Result<()> {
    let mut child = Command::new(program)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to run {}", program))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(rules.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
