//! The guard engine
//!
//! A single task owns the evaluator and the kill switch. Probe results and
//! operator commands arrive over channels and are handled one at a time, so
//! no two results are ever evaluated concurrently and a reset can never
//! interleave with an evaluation. Everything else reads the published
//! snapshot through a `StatusHandle`.

use crate::config::ProbeSettings;
use crate::error::{GuardError, GuardResult};
use crate::evaluator::{Evaluator, EvaluatorState, Transition, TrustLevel};
use crate::killswitch::{KillSwitch, KillSwitchState, KillSwitchStatus};
use crate::probe::ProbeResult;
use crate::report::{Event, StatusReporter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Requests from the control plane
#[derive(Debug)]
pub enum Command {
    /// Leave compromised; answers with the resulting trust level
    Reset(oneshot::Sender<GuardResult<TrustLevel>>),
    Stop,
}

/// Point-in-time view of the whole engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub evaluator: EvaluatorState,
    pub kill_switch: KillSwitchState,
    pub taken_at: DateTime<Utc>,
}

/// Concurrent read access to the engine state
#[derive(Clone)]
pub struct StatusHandle {
    evaluator: Arc<RwLock<EvaluatorState>>,
    kill_switch: KillSwitchStatus,
}

impl StatusHandle {
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            evaluator: self.evaluator.read().unwrap_or_else(|e| e.into_inner()).clone(),
            kill_switch: self.kill_switch.get(),
            taken_at: Utc::now(),
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.evaluator.read().unwrap_or_else(|e| e.into_inner()).trust_level
    }
}

pub struct Guard {
    evaluator: Evaluator,
    killswitch: KillSwitch,
    reporter: Arc<dyn StatusReporter>,
    published: Arc<RwLock<EvaluatorState>>,
}

impl Guard {
    pub fn new(settings: &ProbeSettings, killswitch: KillSwitch, reporter: Arc<dyn StatusReporter>) -> Self {
        let evaluator = Evaluator::new(settings);
        let published = Arc::new(RwLock::new(evaluator.state().clone()));
        Self {
            evaluator,
            killswitch,
            reporter,
            published,
        }
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            evaluator: self.published.clone(),
            kill_switch: self.killswitch.status_handle(),
        }
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.evaluator.trust_level()
    }

    /// Evaluate one result; a transition into compromised engages the kill switch
    pub async fn handle_result(&mut self, result: ProbeResult) -> GuardResult<Option<Transition>> {
        self.reporter.notify(&Event::Probe { result: result.clone() });

        let transition = self.evaluator.process(result.clone());
        self.publish();

        if let Some(t) = &transition {
            self.reporter.notify(&Event::Transition(t.clone()));
            if t.to == TrustLevel::Compromised {
                self.killswitch.engage(&result).await?;
            }
        }

        Ok(transition)
    }

    /// Operator reset: restore the network, then leave compromised
    ///
    /// The evaluator only moves once the cutoff has been lifted, so a failed
    /// restore leaves both compromised and engaged and may be retried.
    pub async fn reset(&mut self) -> GuardResult<TrustLevel> {
        let level = self.evaluator.trust_level();
        let leaving = match self.evaluator.check_reset() {
            Ok(leaving) => leaving,
            Err(e) => {
                self.reporter.notify(&Event::ResetRefused { level, at: Utc::now() });
                return Err(e);
            }
        };

        // The switch is released against the level the evaluator is about to enter
        self.killswitch.reset(TrustLevel::Trusted).await?;

        if leaving {
            if let Some(t) = self.evaluator.reset()? {
                self.reporter.notify(&Event::Transition(t));
            }
            self.publish();
        }
        Ok(self.evaluator.trust_level())
    }

    /// Consume results and commands until stopped or the result stream ends
    ///
    /// Returns an error only when the kill switch could not cut the network.
    pub async fn run(
        mut self,
        mut results: mpsc::Receiver<ProbeResult>,
        mut commands: mpsc::Receiver<Command>,
    ) -> GuardResult<()> {
        info!("guard engine running");
        loop {
            tokio::select! {
                biased;
                Some(command) = commands.recv() => match command {
                    Command::Reset(reply) => {
                        let outcome = self.reset().await;
                        match &outcome {
                            Err(e @ GuardError::PreconditionFailed { .. }) => info!("reset: {}", e),
                            Err(e) => error!("reset: {}", e),
                            Ok(_) => {}
                        }
                        let _ = reply.send(outcome);
                    }
                    Command::Stop => {
                        debug!("stop requested");
                        break;
                    }
                },
                next = results.recv() => match next {
                    Some(result) => {
                        if let Err(e) = self.handle_result(result).await {
                            error!("{}", e);
                            return Err(e);
                        }
                    }
                    None => {
                        debug!("result stream closed");
                        break;
                    }
                },
            }
        }
        info!("guard engine stopped at trust level {}", self.evaluator.trust_level());
        Ok(())
    }

    fn publish(&self) {
        *self.published.write().unwrap_or_else(|e| e.into_inner()) = self.evaluator.state().clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CutoffConfig, ProbeConfig};
    use crate::killswitch::tests::FakeCutoff;
    use crate::probe::{ProbeKind, Severity};
    use crate::report::MemoryReporter;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        guard: Guard,
        applies: Arc<AtomicU32>,
        reverts: Arc<AtomicU32>,
        reporter: Arc<MemoryReporter>,
    }

    fn fixture(failures: u32) -> Fixture {
        fixture_with(FakeCutoff {
            failures,
            ..Default::default()
        })
    }

    fn fixture_with(cutoff: FakeCutoff) -> Fixture {
        let applies = cutoff.applies.clone();
        let reverts = cutoff.reverts.clone();
        let reporter = Arc::new(MemoryReporter::default());
        let config = CutoffConfig {
            max_attempts: 3,
            backoff_secs: 1,
            ..Default::default()
        };
        let killswitch = KillSwitch::new(Box::new(cutoff), &config, reporter.clone());
        let settings = ProbeSettings::uniform(ProbeConfig::new(30, 10, 3));
        Fixture {
            guard: Guard::new(&settings, killswitch, reporter.clone()),
            applies,
            reverts,
            reporter,
        }
    }

    fn pass(kind: ProbeKind) -> ProbeResult {
        ProbeResult::pass(kind, "")
    }

    async fn full_round(guard: &mut Guard) {
        for kind in ProbeKind::ALL {
            guard.handle_result(pass(kind)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_critical_failure_engages_once() {
        let mut f = fixture(0);
        let leak = ProbeResult::fail(ProbeKind::ProxyStatus, Severity::Critical, "SOCKS refused");

        let t = f.guard.handle_result(leak.clone()).await.unwrap().unwrap();
        assert_eq!(t.to, TrustLevel::Compromised);
        f.guard.handle_result(leak).await.unwrap();

        assert_eq!(f.applies.load(Ordering::SeqCst), 1);
        let status = f.guard.status_handle().snapshot();
        assert_eq!(status.evaluator.trust_level, TrustLevel::Compromised);
        assert!(status.kill_switch.engaged);
        assert_eq!(status.kill_switch.reason.unwrap().detail(), "SOCKS refused");
    }

    #[tokio::test]
    async fn test_degraded_does_not_engage() {
        let mut f = fixture(0);
        let warn = ProbeResult::fail(ProbeKind::DnsLeak, Severity::Warning, "timeout");
        f.guard.handle_result(warn.clone()).await.unwrap();
        f.guard.handle_result(warn).await.unwrap();

        assert_eq!(f.guard.trust_level(), TrustLevel::Degraded);
        assert_eq!(f.applies.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_warnings_reaching_threshold_engage() {
        let mut f = fixture(0);
        let warn = ProbeResult::fail(ProbeKind::IpIdentity, Severity::Warning, "check endpoint unreachable");
        f.guard.handle_result(warn.clone()).await.unwrap();
        f.guard.handle_result(warn.clone()).await.unwrap();
        assert_eq!(f.applies.load(Ordering::SeqCst), 0);

        let t = f.guard.handle_result(warn).await.unwrap().unwrap();
        assert_eq!(t.to, TrustLevel::Compromised);
        assert_eq!(f.applies.load(Ordering::SeqCst), 1);
        assert!(f.guard.status_handle().snapshot().kill_switch.engaged);
    }

    #[tokio::test]
    async fn test_failed_restore_keeps_guard_compromised() {
        let mut f = fixture_with(FakeCutoff {
            revert_fails: true,
            ..Default::default()
        });
        f.guard
            .handle_result(ProbeResult::fail(ProbeKind::ProxyStatus, Severity::Critical, "SOCKS refused"))
            .await
            .unwrap();
        full_round(&mut f.guard).await;
        let transitions = f.reporter.count("transition");

        let err = f.guard.reset().await.unwrap_err();
        assert!(matches!(err, GuardError::RevertFailure(_)));
        assert_eq!(f.reporter.count("transition"), transitions);
        assert_eq!(f.reporter.count("restore_failed"), 1);

        let status = f.guard.status_handle().snapshot();
        assert_eq!(status.evaluator.trust_level, TrustLevel::Compromised);
        assert!(status.evaluator.round_complete());
        assert!(status.kill_switch.engaged);
        assert_eq!(f.reverts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_flow() {
        let mut f = fixture(0);
        f.guard
            .handle_result(ProbeResult::fail(ProbeKind::DnsLeak, Severity::Critical, "leak"))
            .await
            .unwrap();

        let err = f.guard.reset().await.unwrap_err();
        assert!(matches!(err, GuardError::PreconditionFailed { .. }));
        assert_eq!(f.reporter.count("reset_refused"), 1);
        assert_eq!(f.reverts.load(Ordering::SeqCst), 0);

        full_round(&mut f.guard).await;
        assert_eq!(f.guard.trust_level(), TrustLevel::Compromised);

        assert_eq!(f.guard.reset().await.unwrap(), TrustLevel::Trusted);
        assert_eq!(f.reverts.load(Ordering::SeqCst), 1);
        assert!(!f.guard.status_handle().snapshot().kill_switch.engaged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cutoff_failure_stops_the_engine() {
        let f = fixture(u32::MAX);
        let (result_tx, result_rx) = mpsc::channel(8);
        let (_command_tx, command_rx) = mpsc::channel(8);
        let engine = tokio::spawn(f.guard.run(result_rx, command_rx));

        result_tx
            .send(ProbeResult::fail(ProbeKind::TrafficAudit, Severity::Critical, "curl -> 93.184.216.34:443"))
            .await
            .unwrap();

        let outcome = engine.await.unwrap();
        assert!(matches!(outcome, Err(GuardError::CutoffFailure { attempts: 3, .. })));
        assert_eq!(f.reporter.count("alarm"), 3);
    }

    #[tokio::test]
    async fn test_commands_are_serialized_with_results() {
        let f = fixture(0);
        let status = f.guard.status_handle();
        let (result_tx, result_rx) = mpsc::channel(8);
        let (command_tx, command_rx) = mpsc::channel(8);
        let engine = tokio::spawn(f.guard.run(result_rx, command_rx));

        result_tx
            .send(ProbeResult::fail(ProbeKind::IpIdentity, Severity::Critical, "IsTor=false"))
            .await
            .unwrap();
        for kind in ProbeKind::ALL {
            result_tx.send(pass(kind)).await.unwrap();
        }
        // Let the engine drain the queue before asking for a reset
        while !status.snapshot().evaluator.round_complete() {
            tokio::task::yield_now().await;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx.send(Command::Reset(reply_tx)).await.unwrap();
        assert_eq!(reply_rx.await.unwrap().unwrap(), TrustLevel::Trusted);

        command_tx.send(Command::Stop).await.unwrap();
        engine.await.unwrap().unwrap();
        assert_eq!(status.trust_level(), TrustLevel::Trusted);
        assert_eq!(f.applies.load(Ordering::SeqCst), 1);
        assert_eq!(f.reverts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_result_stream_ends_the_engine() {
        let f = fixture(0);
        let (result_tx, result_rx) = mpsc::channel::<ProbeResult>(8);
        let (_command_tx, command_rx) = mpsc::channel(8);
        drop(result_tx);
        f.guard.run(result_rx, command_rx).await.unwrap();
    }
}
