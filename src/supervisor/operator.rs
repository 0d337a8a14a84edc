//! Operator commands accepted by the supervisor's monitoring loop.

use serde::Serialize;

use super::health::AgentHealth;
use crate::task::{Fingerprint, StageKind};

/// A request from an operator.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    /// Stop assigning new work to a stage. In-flight tasks finish.
    Pause(StageKind),
    /// Undo a pause.
    Resume(StageKind),
    /// Clear a degraded stage and let it take work again.
    Recover(StageKind),
    /// Change a stage's concurrency ceiling (at least 1).
    SetConcurrency { stage: StageKind, limit: usize },
    /// Change the retry budget of one stage, or of every stage.
    SetRetryBudget {
        stage: Option<StageKind>,
        budget: u32,
    },
    /// Drop a cache entry so the next request produces afresh.
    Invalidate(Fingerprint),
    Status,
}

impl OperatorCommand {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorCommand::Pause(_) => "pause",
            OperatorCommand::Resume(_) => "resume",
            OperatorCommand::Recover(_) => "recover",
            OperatorCommand::SetConcurrency { .. } => "set_concurrency",
            OperatorCommand::SetRetryBudget { .. } => "set_retry_budget",
            OperatorCommand::Invalidate(_) => "invalidate",
            OperatorCommand::Status => "status",
        }
    }
}

/// The loop's answer to an [`OperatorCommand`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum CommandOutcome {
    Ack,
    /// Whether an entry was actually removed.
    Invalidated(bool),
    Status(Vec<AgentHealth>),
    Rejected(String),
}

impl CommandOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandOutcome::Rejected(_))
    }
}
