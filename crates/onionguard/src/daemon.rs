//! Daemon assembly
//!
//! Wires probes, scheduler, engine, kill switch, reporters and the control
//! socket together and runs until stopped.
//!
//! Shutdown order: engine first (stop request or signal), then the scheduler,
//! which lets in-flight probe runs finish within their timeout.

use crate::config::GuardConfig;
use crate::control::ControlServer;
use crate::cutoff::build_cutoff;
use crate::engine::{Command, Guard};
use crate::killswitch::KillSwitch;
use crate::probe::standard_probes;
use crate::report::{DesktopReporter, Event, Journal, Reporters, StatusReporter, TracingReporter};
use crate::scheduler::Scheduler;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Buffered results waiting for the engine
const RESULT_QUEUE: usize = 64;

pub struct DaemonOptions {
    pub socket: PathBuf,
    /// Log instead of touching the firewall
    pub dry_run: bool,
}

/// Reporters enabled by the configuration
pub fn build_reporters(config: &GuardConfig) -> Reporters {
    let mut reporters = Reporters::new().with(Arc::new(TracingReporter));
    if config.reporting.journal {
        reporters = reporters.with(Arc::new(Journal::with_path(config.journal_path())));
    }
    if config.reporting.desktop {
        reporters = reporters.with(Arc::new(DesktopReporter::detect()));
    }
    reporters
}

/// Run until a stop request, SIGINT or SIGTERM
///
/// Returns the engine's error when the network could not be cut off.
pub async fn run(config: GuardConfig, options: DaemonOptions) -> Result<()> {
    let reporter: Arc<dyn StatusReporter> = Arc::new(build_reporters(&config));

    let cutoff = build_cutoff(&config.cutoff, options.dry_run);
    info!("network cutoff backend: {}", cutoff.name());
    let killswitch = KillSwitch::new(cutoff, &config.cutoff, reporter.clone());
    let guard = Guard::new(&config.probes, killswitch, reporter.clone());
    let status = guard.status_handle();

    let server = ControlServer::bind(&options.socket)?;

    let (result_tx, result_rx) = mpsc::channel(RESULT_QUEUE);
    let (command_tx, command_rx) = mpsc::channel(8);

    let mut engine = tokio::spawn(guard.run(result_rx, command_rx));
    let scheduler = Scheduler::start(standard_probes(&config), &config.probes, &config.schedule, result_tx)?;
    let control = tokio::spawn(server.serve(status, command_tx.clone()));

    reporter.notify(&Event::started());

    let outcome = tokio::select! {
        joined = &mut engine => joined,
        _ = shutdown_signal() => {
            info!("shutdown requested");
            let _ = command_tx.send(Command::Stop).await;
            (&mut engine).await
        }
    };

    scheduler.stop().await;
    control.abort();
    let _ = control.await;
    reporter.notify(&Event::stopped());

    outcome.context("engine task failed")??;
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
