//! sciforge: hybrid agent execution and orchestration for staged
//! data-science pipelines.
//!
//! Each pipeline stage is served by a [`agents::StageAgent`] that reuses a
//! cached artifact when it can, otherwise asks a deterministic library
//! backend or a generative (LLM) backend for a transform program, validates
//! it, and executes it under resource limits, falling back between backends
//! within a retry budget. A [`supervisor::Supervisor`] assigns tasks,
//! tracks stage health and handles recovery.

// Core modules
pub mod agents;
pub mod artifact;
pub mod backend;
pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod executor;
pub mod llm;
pub mod metrics;
pub mod monitor;
pub mod supervisor;
pub mod task;
pub mod utils;
pub mod validation;

// Re-export commonly used types
pub use agents::{AgentError, StageAgent, TaskReport};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{BackendError, ConfigError, ExecutionError, LlmError, StoreError};
pub use supervisor::{PipelinePlan, Supervisor, SupervisorError};
pub use task::{StageKind, Task, TaskStatus};
