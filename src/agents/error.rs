//! Error types for stage agents.
//!
//! A stage agent never returns these as `Err`: they travel inside a
//! [`TaskReport`](super::TaskReport) so one failed task cannot stop the
//! pipeline.

use thiserror::Error;

use crate::task::StageKind;

/// Why a task ended in `Failed`.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    /// Every permitted attempt failed.
    #[error("Retry budget exhausted after {attempts} attempts: {}", reasons.join("; "))]
    RetryBudgetExhausted { attempts: u32, reasons: Vec<String> },

    /// No registered backend advertises the operation.
    #[error("No backend covers {stage}/{operation}")]
    NoBackend { stage: StageKind, operation: String },

    /// The task's input could not be loaded.
    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    /// The task was cancelled, usually because its stage was degraded.
    #[error("Task cancelled")]
    Cancelled,

    /// An identical task this one waited behind failed; its reasons are adopted.
    #[error("Concurrent producer failed: {}", reasons.join("; "))]
    ProducerFailed { reasons: Vec<String> },
}

impl AgentError {
    /// Individual failure reasons, for reporting upward.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            AgentError::RetryBudgetExhausted { reasons, .. }
            | AgentError::ProducerFailed { reasons } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}
