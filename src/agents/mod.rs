//! Stage agents.
//!
//! One [`StageAgent`] exists per pipeline stage. It owns nothing but shared
//! handles (cache, backends, validator, executor, monitoring sink) and turns
//! each task it is given into a [`TaskReport`].

pub mod error;
pub mod stage_agent;

pub use error::AgentError;
pub use stage_agent::{
    AgentConfig, AttemptRecord, AttemptStage, StageAgent, TaskReport, DEFAULT_RETRY_BUDGET,
};
