//! Probe scheduling
//!
//! One task per probe kind. A kind never overlaps itself: when a run
//! outlasts its interval the missed ticks are skipped, not queued. Under CPU
//! load intervals stretch (`interval * (1 + load)`, capped), and every wait
//! gets a little random jitter so checks do not fire in lockstep.

use crate::config::{ProbeConfig, ProbeSettings, ScheduleConfig};
use crate::error::{GuardError, GuardResult};
use crate::probe::{Probe, ProbeResult};
use onionguard_core::LoadMonitor;
use rand::Rng;
use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Extra time granted to a run before its task is aborted
const ABORT_GRACE: Duration = Duration::from_secs(1);

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start one timer per probe; results go to `sink` in completion order
    pub fn start(
        probes: Vec<Arc<dyn Probe>>,
        settings: &ProbeSettings,
        schedule: &ScheduleConfig,
        sink: mpsc::Sender<ProbeResult>,
    ) -> GuardResult<Self> {
        let mut seen = HashSet::new();
        for probe in &probes {
            if !seen.insert(probe.kind()) {
                return Err(GuardError::Config(format!("probe {} scheduled twice", probe.kind())));
            }
        }

        let load = if schedule.adaptive {
            Some(Arc::new(Mutex::new(LoadMonitor::default())))
        } else {
            None
        };

        let (shutdown, _) = watch::channel(false);
        let tasks = probes
            .into_iter()
            .map(|probe| {
                let timer = Timer {
                    config: settings.get(probe.kind()).clone(),
                    schedule: schedule.clone(),
                    probe,
                    sink: sink.clone(),
                    shutdown: shutdown.subscribe(),
                    load: load.clone(),
                };
                tokio::spawn(timer.drive())
            })
            .collect::<Vec<_>>();

        info!("scheduler started with {} probe(s)", tasks.len());
        Ok(Self { shutdown, tasks })
    }

    /// Halt every timer; in-flight runs finish (within their timeout) first
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("probe timer ended abnormally: {}", e);
            }
        }
        info!("scheduler stopped");
    }
}

struct Timer {
    probe: Arc<dyn Probe>,
    config: ProbeConfig,
    schedule: ScheduleConfig,
    sink: mpsc::Sender<ProbeResult>,
    shutdown: watch::Receiver<bool>,
    load: Option<Arc<Mutex<LoadMonitor>>>,
}

impl Timer {
    async fn drive(mut self) {
        let kind = self.probe.kind();
        let mut tick = Instant::now();
        let mut wake = tick;

        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => {}
                _ = self.shutdown.changed() => break,
            }

            let result = run_guarded(self.probe.clone(), self.config.timeout()).await;
            debug!(probe = %kind, "{}", result);
            if self.sink.send(result).await.is_err() {
                debug!(probe = %kind, "result sink closed");
                break;
            }

            let load = self
                .load
                .as_ref()
                .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()).load())
                .unwrap_or(0.0);
            let interval = effective_interval(self.config.interval(), &self.schedule, load);

            let (next, skipped) = next_deadline(tick, interval, Instant::now());
            if skipped > 0 {
                debug!(probe = %kind, skipped, "run outlasted its interval, skipping ticks");
            }
            tick = next;
            wake = next + jitter(interval, self.schedule.jitter_secs);
        }
    }
}

/// Run a probe on its own task so a panic cannot take the timer down
async fn run_guarded(probe: Arc<dyn Probe>, timeout: Duration) -> ProbeResult {
    let kind = probe.kind();
    let mut handle = tokio::spawn(async move { probe.run(timeout).await });

    match tokio::time::timeout(timeout + ABORT_GRACE, &mut handle).await {
        Ok(Ok(result)) if result.kind() == kind => result,
        Ok(Ok(result)) => ProbeResult::fault(kind, format!("probe reported a {} result", result.kind())),
        Ok(Err(e)) if e.is_panic() => {
            ProbeResult::fault(kind, format!("probe panicked: {}", panic_message(e.into_panic())))
        }
        Ok(Err(e)) => ProbeResult::fault(kind, format!("probe task failed: {}", e)),
        Err(_) => {
            handle.abort();
            ProbeResult::timeout(kind)
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Interval after load stretching; never shorter than the configured one
pub fn effective_interval(base: Duration, schedule: &ScheduleConfig, load: f64) -> Duration {
    if !schedule.adaptive || load <= schedule.cpu_threshold {
        return base;
    }
    let stretched = base.mul_f64(1.0 + load.clamp(0.0, 1.0));
    let cap = Duration::from_secs(schedule.max_interval_secs);
    stretched.min(cap).max(base)
}

/// First tick after `previous` that is not already in the past, and how many were skipped
pub fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> (Instant, u32) {
    let next = previous + interval;
    if next >= now || interval.is_zero() {
        return (next.max(now), 0);
    }
    let behind = now - next;
    let skipped = (behind.as_nanos() / interval.as_nanos()) as u32 + 1;
    (next + interval * skipped, skipped)
}

/// Random delay of at most `max_secs`, and at most a tenth of the interval
pub fn jitter(interval: Duration, max_secs: f64) -> Duration {
    let cap = max_secs.min(interval.as_secs_f64() * 0.1);
    if cap <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..cap))
}
