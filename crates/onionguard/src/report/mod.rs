//! Status reporting
//!
//! Reporters are sinks for engine events: the log, the journal, desktop
//! alerts. Delivery is fire-and-forget; a reporter that fails logs the
//! failure and never blocks or fails the engine.

mod desktop;
mod journal;

pub use desktop::{Backend, DesktopReporter, Notification, Urgency};
pub use journal::{Journal, JournalQuery};

use crate::evaluator::{TrustLevel, Transition};
use crate::probe::ProbeResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Something the engine wants the outside world to know
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    Started { at: DateTime<Utc> },
    Probe { result: ProbeResult },
    Transition(Transition),
    /// The network cutoff is in place
    Engaged { reason: ProbeResult, at: DateTime<Utc> },
    /// The network cutoff was lifted by an operator reset
    Released { at: DateTime<Utc> },
    /// An operator reset could not lift the cutoff
    RestoreFailed { error: String, at: DateTime<Utc> },
    /// One cutoff attempt failed
    Alarm {
        attempt: u32,
        max_attempts: u32,
        error: String,
        at: DateTime<Utc>,
    },
    ResetRefused { level: TrustLevel, at: DateTime<Utc> },
    Stopped { at: DateTime<Utc> },
}

impl Event {
    pub fn started() -> Self {
        Event::Started { at: Utc::now() }
    }

    pub fn stopped() -> Self {
        Event::Stopped { at: Utc::now() }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Probe { result } => result.observed_at(),
            Event::Transition(t) => t.at,
            Event::Started { at }
            | Event::Engaged { at, .. }
            | Event::Released { at }
            | Event::RestoreFailed { at, .. }
            | Event::Alarm { at, .. }
            | Event::ResetRefused { at, .. }
            | Event::Stopped { at } => *at,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Started { .. } => "started",
            Event::Probe { .. } => "probe",
            Event::Transition(_) => "transition",
            Event::Engaged { .. } => "engaged",
            Event::Released { .. } => "released",
            Event::RestoreFailed { .. } => "restore_failed",
            Event::Alarm { .. } => "alarm",
            Event::ResetRefused { .. } => "reset_refused",
            Event::Stopped { .. } => "stopped",
        }
    }

    /// Failing probes, compromise, alarms
    pub fn is_failure(&self) -> bool {
        match self {
            Event::Probe { result } => !result.ok(),
            Event::Transition(t) => t.to != TrustLevel::Trusted,
            Event::Engaged { .. }
            | Event::Alarm { .. }
            | Event::RestoreFailed { .. }
            | Event::ResetRefused { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Started { .. } => write!(f, "monitoring started"),
            Event::Probe { result } => write!(f, "{}", result),
            Event::Transition(t) => write!(f, "{} -> {}: {}", t.from, t.to, t.reason),
            Event::Engaged { reason, .. } => write!(f, "kill switch engaged ({})", reason),
            Event::Released { .. } => write!(f, "kill switch released"),
            Event::RestoreFailed { error, .. } => write!(f, "network restore failed, still cut off: {}", error),
            Event::Alarm {
                attempt,
                max_attempts,
                error,
                ..
            } => write!(f, "cutoff attempt {}/{} failed: {}", attempt, max_attempts, error),
            Event::ResetRefused { level, .. } => write!(f, "reset refused while {}", level),
            Event::Stopped { .. } => write!(f, "monitoring stopped"),
        }
    }
}

/// Sink for engine events
pub trait StatusReporter: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Writes events to the tracing log
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn notify(&self, event: &Event) {
        match event {
            Event::Probe { result } if result.ok() => tracing::debug!(probe = %result.kind(), "{}", event),
            Event::Probe { result } => warn!(probe = %result.kind(), "{}", event),
            Event::Engaged { .. } | Event::Alarm { .. } | Event::RestoreFailed { .. } => error!("{}", event),
            Event::Transition(t) if t.to == TrustLevel::Compromised => error!("{}", event),
            Event::ResetRefused { .. } => warn!("{}", event),
            _ => info!("{}", event),
        }
    }
}

/// Fans one event out to several reporters
#[derive(Default, Clone)]
pub struct Reporters {
    sinks: Vec<Arc<dyn StatusReporter>>,
}

impl Reporters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.sinks.push(reporter);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StatusReporter for Reporters {
    fn notify(&self, event: &Event) {
        for sink in &self.sinks {
            sink.notify(event);
        }
    }
}

/// Keeps every event in memory
#[cfg(test)]
#[derive(Default)]
pub(crate) struct MemoryReporter {
    events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl MemoryReporter {
    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.events().iter().filter(|e| e.name() == name).count()
    }
}

#[cfg(test)]
impl StatusReporter for MemoryReporter {
    fn notify(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{ProbeKind, Severity};

    #[test]
    fn test_event_json_is_tagged() {
        let event = Event::Probe {
            result: ProbeResult::fail(ProbeKind::DnsLeak, Severity::Critical, "8.8.8.8"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "probe");
        assert_eq!(json["result"]["kind"], "dns_leak");

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_failure_classification() {
        assert!(Event::Probe {
            result: ProbeResult::timeout(ProbeKind::IpIdentity)
        }
        .is_failure());
        assert!(!Event::Probe {
            result: ProbeResult::pass(ProbeKind::IpIdentity, "")
        }
        .is_failure());
        assert!(!Event::started().is_failure());
        assert!(Event::RestoreFailed {
            error: "iptables-restore: exit 1".to_string(),
            at: Utc::now()
        }
        .is_failure());
        assert!(Event::ResetRefused {
            level: TrustLevel::Compromised,
            at: Utc::now()
        }
        .is_failure());
    }

    #[test]
    fn test_fan_out_reaches_every_sink() {
        let a = Arc::new(MemoryReporter::default());
        let b = Arc::new(MemoryReporter::default());
        let reporters = Reporters::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingReporter));
        assert_eq!(reporters.len(), 3);

        reporters.notify(&Event::started());
        assert_eq!(a.count("started"), 1);
        assert_eq!(b.count("started"), 1);
    }
}
