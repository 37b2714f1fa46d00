//! Desktop alerts
//!
//! Only events an operator must see become notifications: compromise, the
//! kill switch, cutoff alarms and recovery. The notifier runs on its own
//! thread so a hung notification daemon never stalls the engine.

use super::{Event, StatusReporter};
use crate::evaluator::TrustLevel;
use anyhow::{bail, Result};
use std::process::Command;
use tracing::{debug, warn};

const TITLE: &str = "onionguard";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Urgency {
    #[default]
    Normal,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub urgency: Urgency,
}

impl Notification {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            title: TITLE.to_string(),
            message: message.into(),
            urgency: Urgency::Normal,
        }
    }

    pub fn critical(mut self) -> Self {
        self.urgency = Urgency::Critical;
        self
    }

    /// The alert for an event, if it deserves one
    pub fn for_event(event: &Event) -> Option<Self> {
        match event {
            Event::Transition(t) if t.to == TrustLevel::Compromised => {
                Some(Self::new(format!("Anonymity compromised: {}", t.reason)).critical())
            }
            Event::Transition(t) if t.to == TrustLevel::Trusted => {
                Some(Self::new(format!("Anonymity restored ({})", t.reason)))
            }
            Event::Engaged { reason, .. } => {
                Some(Self::new(format!("Network cut off: {}", reason.detail())).critical())
            }
            Event::Alarm {
                attempt,
                max_attempts,
                error,
                ..
            } => Some(
                Self::new(format!(
                    "Network cutoff FAILED ({}/{}): {}",
                    attempt, max_attempts, error
                ))
                .critical(),
            ),
            Event::Released { .. } => Some(Self::new("Network restored by operator reset")),
            Event::RestoreFailed { error, .. } => {
                Some(Self::new(format!("Network restore failed, traffic stays blocked: {}", error)).critical())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Linux notify-send
    NotifySend,
    /// macOS osascript
    Osascript,
    /// Fallback echo
    Echo,
}

impl Backend {
    /// Detect the best available backend for the current platform
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            return Self::Osascript;
        }
        if Self::command_exists("notify-send") {
            return Self::NotifySend;
        }
        Self::Echo
    }

    fn command_exists(cmd: &str) -> bool {
        Command::new("which")
            .arg(cmd)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NotifySend => "notify-send",
            Self::Osascript => "osascript",
            Self::Echo => "echo",
        }
    }

    /// Send and wait for the notifier to exit
    pub fn send(&self, notification: &Notification) -> Result<()> {
        let mut cmd = match self {
            Self::NotifySend => {
                let mut cmd = Command::new("notify-send");
                cmd.args([&notification.title, &notification.message]);
                if notification.urgency == Urgency::Critical {
                    cmd.args(["--urgency", "critical"]);
                }
                cmd
            }
            Self::Osascript => {
                let title = notification.title.replace('"', r#"\""#);
                let message = notification.message.replace('"', r#"\""#);
                let mut script = format!(r#"display notification "{}" with title "{}""#, message, title);
                if notification.urgency == Urgency::Critical {
                    script.push_str(r#" sound name "Basso""#);
                }
                let mut cmd = Command::new("osascript");
                cmd.args(["-e", &script]);
                cmd
            }
            Self::Echo => {
                println!("[{}] {}", notification.title, notification.message);
                return Ok(());
            }
        };

        let status = cmd.status()?;
        if !status.success() {
            bail!("{} failed with status: {}", self.name(), status);
        }
        Ok(())
    }
}

pub struct DesktopReporter {
    backend: Backend,
}

impl DesktopReporter {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn detect() -> Self {
        let backend = Backend::detect();
        debug!("desktop notifications via {}", backend.name());
        Self::new(backend)
    }
}

impl StatusReporter for DesktopReporter {
    fn notify(&self, event: &Event) {
        let Some(notification) = Notification::for_event(event) else {
            return;
        };
        let backend = self.backend;
        std::thread::spawn(move || {
            if let Err(e) = backend.send(&notification) {
                warn!("desktop notification failed: {:#}", e);
            }
        });
    }
}
