//! onionguard core - Shared functionality for the onionguard tools
//!
//! Paths, process-table queries, load sampling and output formatting used by
//! the monitoring daemon and its CLI.

pub mod format;
pub mod load;
pub mod paths;
pub mod process;

pub use load::LoadMonitor;
pub use paths::Paths;
