//! Event journal
//!
//! Every event is appended as one JSON line.
//! Storage: ~/.local/share/onionguard/journal.log

use super::{Event, StatusReporter};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use onionguard_core::paths::ensure_parent;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub struct Journal {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Journal {
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event
    pub fn append(&self, event: &Event) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        ensure_parent(&self.path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open journal at {:?}", self.path))?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(event)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Most recent events first
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>> {
        self.query(JournalQuery::default().limit(limit))
    }

    pub fn query(&self, query: JournalQuery) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        // Unparseable lines (torn writes, older formats) are skipped
        let mut events: Vec<Event> = reader
            .lines()
            .filter_map(|line| line.ok().and_then(|l| serde_json::from_str(&l).ok()))
            .filter(|event: &Event| query.matches(event))
            .collect();

        events.sort_by_key(|e| std::cmp::Reverse(e.at()));

        if let Some(limit) = query.limit {
            events.truncate(limit);
        }

        Ok(events)
    }
}

impl StatusReporter for Journal {
    fn notify(&self, event: &Event) {
        if let Err(e) = self.append(event) {
            warn!("journal write failed: {:#}", e);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JournalQuery {
    failures_only: bool,
    since: Option<DateTime<Utc>>,
    limit: Option<usize>,
    name: Option<String>,
}

impl JournalQuery {
    /// Only failing probes, compromise and alarms
    pub fn failures(mut self) -> Self {
        self.failures_only = true;
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter by event type (`probe`, `transition`, ...)
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    fn matches(&self, event: &Event) -> bool {
        if self.failures_only && !event.is_failure() {
            return false;
        }

        if let Some(since) = self.since {
            if event.at() < since {
                return false;
            }
        }

        if let Some(ref name) = self.name {
            if event.name() != name {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{TrustLevel, Transition};
    use crate::probe::{ProbeKind, ProbeResult, Severity};
    use tempfile::tempdir;

    fn probe(ok: bool) -> Event {
        let result = if ok {
            ProbeResult::pass(ProbeKind::ProxyStatus, "up")
        } else {
            ProbeResult::fail(ProbeKind::ProxyStatus, Severity::Critical, "down")
        };
        Event::Probe { result }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let journal = Journal::with_path(dir.path().join("nested").join("journal.log"));

        journal.notify(&Event::started());
        journal.notify(&probe(true));

        let events = journal.recent(10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "probe");
        assert_eq!(events[1].name(), "started");
    }

    #[test]
    fn test_query_filters() {
        let dir = tempdir().unwrap();
        let journal = Journal::with_path(dir.path().join("journal.log"));

        for i in 0..6 {
            journal.append(&probe(i % 3 != 0)).unwrap();
        }
        journal
            .append(&Event::Transition(Transition {
                from: TrustLevel::Trusted,
                to: TrustLevel::Compromised,
                reason: "down".to_string(),
                at: Utc::now(),
            }))
            .unwrap();

        let failures = journal.query(JournalQuery::default().failures()).unwrap();
        assert_eq!(failures.len(), 3);

        let transitions = journal.query(JournalQuery::default().name("transition")).unwrap();
        assert_eq!(transitions.len(), 1);

        assert_eq!(journal.recent(4).unwrap().len(), 4);
    }

    #[test]
    fn test_query_since_drops_older_entries() {
        let dir = tempdir().unwrap();
        let journal = Journal::with_path(dir.path().join("journal.log"));

        journal
            .append(&Event::Released {
                at: Utc::now() - chrono::Duration::hours(3),
            })
            .unwrap();
        journal.append(&Event::started()).unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let events = journal.query(JournalQuery::default().since(cutoff)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "started");
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempdir().unwrap();
        let journal = Journal::with_path(dir.path().join("absent.log"));
        assert!(journal.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.log");
        std::fs::write(&path, "not json\n{\"type\":\"unknown\"}\n").unwrap();

        let journal = Journal::with_path(path);
        journal.append(&Event::stopped()).unwrap();
        let events = journal.recent(10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "stopped");
    }
}
