//! CLI command definitions and handlers

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::task::JoinSet;

use onionguard::config::{ConfigSource, GuardConfig, YamlConfigSource};
use onionguard::control::ControlClient;
use onionguard::daemon::{self, DaemonOptions};
use onionguard::engine::StatusSnapshot;
use onionguard::error::GuardError;
use onionguard::probe::{standard_probes, ProbeKind, ProbeResult};
use onionguard::report::{Journal, JournalQuery};
use onionguard::TrustLevel;
use onionguard_core::format::{duration, relative_time, truncate};
use onionguard_core::Paths;

/// onionguard - Tor anonymity monitor and network kill switch
#[derive(Parser)]
#[command(name = "onionguard")]
#[command(version)]
#[command(about = "Continuously verify Tor anonymity and cut the network on a leak")]
#[command(long_about = "Continuously verify Tor anonymity and cut the network on a leak.\n\n\
    Four probes run on their own timers: proxy liveness, DNS leaks, exit\n\
    identity and a connection audit. A proven leak, or a failure that keeps\n\
    repeating, engages the kill switch. The network stays cut until an\n\
    operator runs `onionguard reset` after a full round of passing checks.")]
#[command(after_help = "EXAMPLES:\n\
    sudo onionguard run\n\
    onionguard run --dry-run\n\
    onionguard check --probe dns\n\
    onionguard status --json\n\
    onionguard history --failures --hours 24\n\
    sudo onionguard reset")]
pub struct Cli {
    /// Configuration file (default: ~/.config/onionguard/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Control socket of the daemon
    #[arg(long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the monitor in the foreground
    Run {
        /// Log instead of touching the firewall
        #[arg(long)]
        dry_run: bool,
    },

    /// Run the probes once and print their verdicts
    Check {
        /// Only these probes: proxy, dns, ip, traffic
        #[arg(short, long)]
        probe: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the daemon's trust level and kill switch state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Restore the network after a full passing round
    Reset,

    /// Stop the daemon
    Stop,

    /// Show journal entries
    History {
        /// Number of entries
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Only failures, compromise and alarms
        #[arg(long)]
        failures: bool,

        /// Only entries from the last N hours
        #[arg(long)]
        hours: Option<u32>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config {
        /// Output as JSON instead of YAML
        #[arg(long)]
        json: bool,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<GuardConfig> {
    let source = match path {
        Some(path) => YamlConfigSource::new(path),
        None => YamlConfigSource::default_location(),
    };
    source.load()
}

fn client(socket: Option<PathBuf>) -> ControlClient {
    ControlClient::new(socket.unwrap_or_else(|| Paths::new().socket()))
}

/// Run the monitor until stopped
pub async fn cmd_run(config: Option<PathBuf>, socket: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let config = load_config(config)?;
    let options = DaemonOptions {
        socket: socket.unwrap_or_else(|| Paths::new().socket()),
        dry_run,
    };

    match daemon::run(config, options).await {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.downcast_ref::<GuardError>(), Some(GuardError::CutoffFailure { .. })) => {
            eprintln!("FATAL: {}", e);
            eprintln!("The network could not be cut off. Traffic may be leaking outside Tor.");
            std::process::exit(2);
        }
        Err(e) => Err(e),
    }
}

/// Run probes once
pub async fn cmd_check(config: Option<PathBuf>, only: Vec<String>, json_output: bool) -> Result<()> {
    let config = load_config(config)?;

    let mut kinds = Vec::new();
    for name in &only {
        match ProbeKind::from_str(name) {
            Some(kind) => kinds.push(kind),
            None => bail!("Unknown probe: {} (expected proxy, dns, ip or traffic)", name),
        }
    }

    let mut set = JoinSet::new();
    for probe in standard_probes(&config) {
        if !kinds.is_empty() && !kinds.contains(&probe.kind()) {
            continue;
        }
        let timeout = config.probes.get(probe.kind()).timeout();
        set.spawn(async move { probe.run(timeout).await });
    }

    let mut results: Vec<ProbeResult> = Vec::new();
    while let Some(joined) = set.join_next().await {
        results.push(joined?);
    }
    results.sort_by_key(|r| r.kind());

    if json_output {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        println!("{:<15} {:<6} {:<10} DETAIL", "PROBE", "OK", "SEVERITY");
        println!("{}", "-".repeat(80));
        for result in &results {
            println!(
                "{:<15} {:<6} {:<10} {}",
                result.kind().as_str(),
                if result.ok() { "ok" } else { "FAIL" },
                result.severity().as_str(),
                truncate(result.detail(), 46)
            );
        }
    }

    if results.iter().all(|r| r.ok()) {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

/// Show daemon status
pub async fn cmd_status(socket: Option<PathBuf>, json_output: bool) -> Result<()> {
    let status = client(socket).status().await?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print_status(&status);
    }
    Ok(())
}

fn print_status(status: &StatusSnapshot) {
    let evaluator = &status.evaluator;
    let level = match evaluator.trust_level {
        TrustLevel::Trusted => "trusted".to_string(),
        other => other.as_str().to_uppercase(),
    };
    let held = Utc::now().signed_duration_since(evaluator.since).num_seconds().max(0);
    println!("Trust level:  {} for {}", level, duration(held as f64));

    let ks = &status.kill_switch;
    if ks.engaged {
        let when = ks.engaged_at.map(relative_time).unwrap_or_default();
        println!("Kill switch:  ENGAGED {}", when);
        if let Some(reason) = &ks.reason {
            println!("  reason:     {}", reason);
        }
    } else {
        println!("Kill switch:  off");
    }

    if evaluator.trust_level != TrustLevel::Trusted {
        let round: Vec<String> = ProbeKind::ALL
            .iter()
            .map(|k| {
                let mark = match evaluator.round.get(k) {
                    Some(true) => "ok",
                    Some(false) => "FAIL",
                    None => "-",
                };
                format!("{} {}", k, mark)
            })
            .collect();
        println!("Round:        {}", round.join(", "));
    }

    println!();
    println!("{:<15} {:<7} {:<6} {:<10} DETAIL", "PROBE", "STREAK", "LAST", "WHEN");
    println!("{}", "-".repeat(80));
    for kind in ProbeKind::ALL {
        let streak = evaluator.consecutive_failures.get(&kind).copied().unwrap_or(0);
        match evaluator.last_result.get(&kind) {
            Some(result) => println!(
                "{:<15} {:<7} {:<6} {:<10} {}",
                kind.as_str(),
                streak,
                if result.ok() { "ok" } else { "FAIL" },
                relative_time(result.observed_at()),
                truncate(result.detail(), 36)
            ),
            None => println!("{:<15} {:<7} {:<6} {:<10} -", kind.as_str(), streak, "-", "never"),
        }
    }
}

/// Ask the daemon to restore the network
pub async fn cmd_reset(socket: Option<PathBuf>) -> Result<()> {
    match client(socket).reset().await {
        Ok(level) => {
            println!("Reset accepted, trust level is {}", level);
            Ok(())
        }
        Err(e) => {
            eprintln!("Reset refused: {}", e);
            std::process::exit(1);
        }
    }
}

/// Stop the daemon
pub async fn cmd_stop(socket: Option<PathBuf>) -> Result<()> {
    client(socket).stop().await?;
    println!("Stop requested");
    Ok(())
}

/// Show journal entries
pub fn cmd_history(
    config: Option<PathBuf>,
    limit: usize,
    failures: bool,
    hours: Option<u32>,
    json_output: bool,
) -> Result<()> {
    let config = load_config(config)?;
    let journal = Journal::with_path(config.journal_path());

    let mut query = JournalQuery::default().limit(limit);
    if failures {
        query = query.failures();
    }
    if let Some(hours) = hours {
        query = query.since(Utc::now() - chrono::Duration::hours(i64::from(hours)));
    }
    let events = journal.query(query)?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&events)?);
    } else if events.is_empty() {
        println!("No journal entries in {}", journal.path().display());
    } else {
        for event in &events {
            println!(
                "{:<10} {:<14} {}",
                relative_time(event.at()),
                event.name(),
                truncate(&event.to_string(), 80)
            );
        }
    }
    Ok(())
}

/// Print the effective configuration
pub fn cmd_config(config: Option<PathBuf>, json_output: bool) -> Result<()> {
    let config = load_config(config)?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}
