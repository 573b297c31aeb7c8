use std::fmt::Display;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use serde::Serialize;

use crate::consts::SIGNAL_EXIT_OFFSET;

/// How the target program ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exited(i32),
    Signaled(Signal),
}

impl Outcome {
    /// The code a shell would report: the exit code, or 128 plus the signal number
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Exited(code) => *code,
            Outcome::Signaled(sig) => SIGNAL_EXIT_OFFSET + *sig as i32,
        }
    }

    /// Extracts the outcome from a terminal wait status
    pub fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Outcome::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(Outcome::Signaled(sig)),
            _ => None,
        }
    }
}

impl Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Exited(code) => write!(f, "exited with {code}"),
            Outcome::Signaled(sig) => write!(f, "killed by {sig}"),
        }
    }
}

/// Number of times the breakpoint of one symbol was hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HitCount {
    pub symbol: String,
    pub hits: usize,
}

/// Result of one traced run
#[derive(Debug, Clone)]
pub struct TraceReport {
    pub outcome: Outcome,
    pub hits: Vec<HitCount>,
}

impl TraceReport {
    /// Hits recorded for `symbol`, 0 if it was never intercepted
    pub fn hits_of(&self, symbol: &str) -> usize {
        self.hits
            .iter()
            .filter(|h| h.symbol == symbol)
            .map(|h| h.hits)
            .sum()
    }
}
