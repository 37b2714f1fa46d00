//! Errors raised by the evaluator, kill switch and configuration
//!
//! Probe-level faults never show up here: they are folded into a negative
//! `ProbeResult` by the probe or the scheduler.

use crate::evaluator::TrustLevel;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Reset refused: trust level is {level}, a full passing round is required")]
    PreconditionFailed { level: TrustLevel },

    #[error("Network cutoff failed after {attempts} attempt(s): {last_error}")]
    CutoffFailure { attempts: u32, last_error: String },

    #[error("Network restore failed, traffic stays blocked: {0}")]
    RevertFailure(String),

    #[error("{operation} timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type GuardResult<T> = std::result::Result<T, GuardError>;
