//! onionguard - continuous verification that traffic leaves through Tor
//!
//! Four probes (proxy liveness, DNS leaks, exit identity, connection audit)
//! run on independent timers. Their results are folded, one at a time, into
//! a trust level; when it becomes compromised the kill switch cuts the host
//! off the network until an operator resets it after a clean round.

pub mod config;
pub mod control;
pub mod cutoff;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod killswitch;
pub mod probe;
pub mod report;
pub mod scheduler;

pub use config::{ConfigSource, GuardConfig, YamlConfigSource};
pub use engine::{Guard, StatusHandle, StatusSnapshot};
pub use error::{GuardError, GuardResult};
pub use evaluator::{Evaluator, Transition, TrustLevel};
pub use killswitch::{KillSwitch, KillSwitchState};
pub use probe::{Probe, ProbeKind, ProbeResult, Severity};
pub use report::{Event, StatusReporter};
pub use scheduler::Scheduler;
