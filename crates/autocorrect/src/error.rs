//! Error taxonomy for lookups and process startup.

use std::time::Duration;

use crate::supervisor::{ProcessExit, SpawnError};

/// Why a lookup did not produce suggestions.
///
/// `Clone` so a single fatal pipe condition can fail every pending caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// Empty or missing word. Rejected before it reaches the queue.
    #[error("input word is required")]
    MissingInput,

    /// The process never started, crashed, is restarting, or is shut down.
    #[error("suggestion process unavailable")]
    ProcessUnavailable,

    /// The response for this request could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// The process answered with an explicit error.
    #[error("suggestion process rejected the word: {0}")]
    Rejected(String),

    /// The process did not answer in time. The pipe was reset.
    #[error("no response from suggestion process within {0:?}")]
    Timeout(Duration),
}

impl LookupError {
    /// True for errors caused by the caller's input rather than the pipe.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MissingInput)
    }
}

/// Failure to bring the process to a ready state.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("process exited during warm-up ({0})")]
    ExitedDuringWarmup(ProcessExit),

    #[error("readiness probe got no response within {0:?}")]
    ProbeTimeout(Duration),

    #[error("readiness probe failed: {0}")]
    Probe(String),
}
