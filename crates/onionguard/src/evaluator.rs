//! Trust evaluation
//!
//! Folds probe results, one at a time, into a single trust level:
//!
//! - trusted -> degraded: a failure that is neither critical nor at threshold
//! - any -> compromised: a critical failure, or a failure streak reaching its
//!   kind's threshold
//! - degraded -> trusted: a full round (every kind reported since entering
//!   degraded, latest result of each kind ok)
//! - compromised -> trusted: only through `reset`, and only when a full round
//!   has been observed since entering compromised

use crate::config::ProbeSettings;
use crate::error::{GuardError, GuardResult};
use crate::probe::{ProbeKind, ProbeResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// Aggregate safety verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Every probe agrees the host is anonymized
    Trusted,
    /// Something failed, but nothing proves a leak yet
    Degraded,
    /// A leak is proven or a failure persisted; the network is cut
    Compromised,
}

impl TrustLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Degraded => "degraded",
            TrustLevel::Compromised => "compromised",
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A change of trust level and what caused it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: TrustLevel,
    pub to: TrustLevel,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl Transition {
    fn new(from: TrustLevel, to: TrustLevel, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

/// State owned by the evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorState {
    pub trust_level: TrustLevel,
    /// When the current level was entered
    pub since: DateTime<Utc>,
    pub consecutive_failures: BTreeMap<ProbeKind, u32>,
    pub last_result: BTreeMap<ProbeKind, ProbeResult>,
    /// Latest verdict per kind since the current non-trusted level was entered
    pub round: BTreeMap<ProbeKind, bool>,
}

impl EvaluatorState {
    fn new() -> Self {
        Self {
            trust_level: TrustLevel::Trusted,
            since: Utc::now(),
            consecutive_failures: ProbeKind::ALL.iter().map(|k| (*k, 0)).collect(),
            last_result: BTreeMap::new(),
            round: BTreeMap::new(),
        }
    }

    /// Every kind reported and the latest report of each is ok
    pub fn round_complete(&self) -> bool {
        ProbeKind::ALL.iter().all(|k| self.round.get(k) == Some(&true))
    }
}

pub struct Evaluator {
    thresholds: BTreeMap<ProbeKind, u32>,
    state: EvaluatorState,
}

impl Evaluator {
    pub fn new(settings: &ProbeSettings) -> Self {
        let thresholds = ProbeKind::ALL
            .iter()
            .map(|k| (*k, settings.get(*k).failure_threshold.max(1)))
            .collect();
        Self {
            thresholds,
            state: EvaluatorState::new(),
        }
    }

    pub fn state(&self) -> &EvaluatorState {
        &self.state
    }

    pub fn trust_level(&self) -> TrustLevel {
        self.state.trust_level
    }

    pub fn consecutive_failures(&self, kind: ProbeKind) -> u32 {
        self.state.consecutive_failures.get(&kind).copied().unwrap_or(0)
    }

    pub fn threshold(&self, kind: ProbeKind) -> u32 {
        self.thresholds.get(&kind).copied().unwrap_or(1)
    }

    /// Fold one result into the state; returns the transition it caused
    pub fn process(&mut self, result: ProbeResult) -> Option<Transition> {
        let kind = result.kind();
        let ok = result.ok();

        let streak = {
            let count = self.state.consecutive_failures.entry(kind).or_insert(0);
            *count = if ok { 0 } else { *count + 1 };
            *count
        };
        let threshold = self.threshold(kind);

        let from = self.state.trust_level;
        let compromise = if result.is_critical_failure() {
            Some(format!("critical failure: {}", result))
        } else if !ok && streak >= threshold {
            Some(format!("{} failed {} times in a row: {}", kind, streak, result.detail()))
        } else {
            None
        };

        let transition = match (from, compromise) {
            (TrustLevel::Compromised, _) => None,
            (_, Some(reason)) => Some(Transition::new(from, TrustLevel::Compromised, reason)),
            (TrustLevel::Trusted, None) if !ok => Some(Transition::new(
                from,
                TrustLevel::Degraded,
                format!("{} failed ({}/{}): {}", kind, streak, threshold, result.detail()),
            )),
            _ => None,
        };

        if let Some(t) = &transition {
            self.enter(t.to);
        }
        self.state.round.insert(kind, ok);
        self.state.last_result.insert(kind, result);

        if transition.is_none() && from == TrustLevel::Degraded && self.state.round_complete() {
            let t = Transition::new(from, TrustLevel::Trusted, "full round passed");
            self.enter(TrustLevel::Trusted);
            info!("trust restored: {}", t.reason);
            return Some(t);
        }

        match &transition {
            Some(t) if t.to == TrustLevel::Compromised => warn!("host compromised: {}", t.reason),
            Some(t) => info!("trust {} -> {}: {}", t.from, t.to, t.reason),
            None => debug!(probe = %kind, streak, "trust level unchanged ({})", from),
        }

        transition
    }

    /// Whether `reset` would leave compromised, without changing anything
    ///
    /// Already trusted: `Ok(false)`. Degraded, or compromised without a full
    /// round: refused.
    pub fn check_reset(&self) -> GuardResult<bool> {
        let level = self.state.trust_level;
        match level {
            TrustLevel::Trusted => Ok(false),
            TrustLevel::Compromised if self.state.round_complete() => Ok(true),
            _ => Err(GuardError::PreconditionFailed { level }),
        }
    }

    /// Leave compromised once a full passing round has been observed
    pub fn reset(&mut self) -> GuardResult<Option<Transition>> {
        if !self.check_reset()? {
            return Ok(None);
        }
        let t = Transition::new(
            self.state.trust_level,
            TrustLevel::Trusted,
            "operator reset after a full passing round",
        );
        self.enter(TrustLevel::Trusted);
        info!("{}", t.reason);
        Ok(Some(t))
    }

    fn enter(&mut self, level: TrustLevel) {
        self.state.trust_level = level;
        self.state.since = Utc::now();
        self.state.round.clear();
    }
}
