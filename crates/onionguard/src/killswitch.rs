//! Kill switch
//!
//! Owns the engaged flag. Engaging is idempotent and retried with
//! exponential backoff, each attempt bounded by the cutoff timeout; every
//! failed attempt raises an alarm. Disengaging is only possible through
//! `reset`, and only when the evaluator is back to trusted.

use crate::config::CutoffConfig;
use crate::cutoff::NetworkCutoff;
use crate::error::{GuardError, GuardResult};
use crate::evaluator::TrustLevel;
use crate::probe::ProbeResult;
use crate::report::{Event, StatusReporter};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub engaged: bool,
    pub engaged_at: Option<DateTime<Utc>>,
    /// The result that triggered the cutoff
    pub reason: Option<ProbeResult>,
}

/// Read-only view of the kill switch, safe to share across tasks
#[derive(Clone, Default)]
pub struct KillSwitchStatus(Arc<RwLock<KillSwitchState>>);

impl KillSwitchStatus {
    pub fn get(&self) -> KillSwitchState {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set(&self, state: KillSwitchState) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

pub struct KillSwitch {
    cutoff: Box<dyn NetworkCutoff>,
    state: KillSwitchStatus,
    timeout: Duration,
    max_attempts: u32,
    backoff: Duration,
    reporter: Arc<dyn StatusReporter>,
}

impl KillSwitch {
    pub fn new(cutoff: Box<dyn NetworkCutoff>, config: &CutoffConfig, reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            cutoff,
            state: KillSwitchStatus::default(),
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff(),
            reporter,
        }
    }

    pub fn status(&self) -> KillSwitchState {
        self.state.get()
    }

    /// A handle for readers outside the engine task
    pub fn status_handle(&self) -> KillSwitchStatus {
        self.state.clone()
    }

    pub fn is_engaged(&self) -> bool {
        self.state.get().engaged
    }

    /// Cut the network; a no-op when already engaged
    ///
    /// Fails with `CutoffFailure` once every attempt has failed. The caller
    /// must treat that as fatal: the host may be leaking.
    pub async fn engage(&mut self, reason: &ProbeResult) -> GuardResult<()> {
        if self.is_engaged() {
            debug!("kill switch already engaged");
            return Ok(());
        }

        let mut delay = self.backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.max_attempts {
            match tokio::time::timeout(self.timeout, self.cutoff.apply()).await {
                Ok(Ok(())) => {
                    let at = Utc::now();
                    self.state.set(KillSwitchState {
                        engaged: true,
                        engaged_at: Some(at),
                        reason: Some(reason.clone()),
                    });
                    info!(backend = self.cutoff.name(), attempt, "kill switch engaged");
                    self.reporter.notify(&Event::Engaged {
                        reason: reason.clone(),
                        at,
                    });
                    return Ok(());
                }
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(_) => last_error = format!("timed out after {}s", self.timeout.as_secs()),
            }

            error!(
                backend = self.cutoff.name(),
                "network cutoff attempt {}/{} failed: {}", attempt, self.max_attempts, last_error
            );
            self.reporter.notify(&Event::Alarm {
                attempt,
                max_attempts: self.max_attempts,
                error: last_error.clone(),
                at: Utc::now(),
            });

            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
        }

        Err(GuardError::CutoffFailure {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Restore the network once the evaluator is trusted again
    ///
    /// When the restore itself fails the switch stays engaged and the
    /// reset may be retried.
    pub async fn reset(&mut self, trust_level: TrustLevel) -> GuardResult<()> {
        if trust_level != TrustLevel::Trusted {
            return Err(GuardError::PreconditionFailed { level: trust_level });
        }
        if !self.is_engaged() {
            return Ok(());
        }

        let failure = match tokio::time::timeout(self.timeout, self.cutoff.revert()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(GuardError::RevertFailure(format!("{:#}", e))),
            Err(_) => Some(GuardError::Timeout {
                operation: "network restore".to_string(),
                seconds: self.timeout.as_secs(),
            }),
        };
        if let Some(e) = failure {
            error!(backend = self.cutoff.name(), "kill switch stays engaged: {}", e);
            self.reporter.notify(&Event::RestoreFailed {
                error: e.to_string(),
                at: Utc::now(),
            });
            return Err(e);
        }

        self.state.set(KillSwitchState::default());
        info!(backend = self.cutoff.name(), "kill switch released");
        self.reporter.notify(&Event::Released { at: Utc::now() });
        Ok(())
    }
}
