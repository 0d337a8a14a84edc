//! Capability backends.
//!
//! A backend turns a [`Task`] into an [`Artifact`]. Two kinds exist:
//! - [`LibraryBackend`]: fixed, deterministic routines per (stage, operation)
//! - [`GenerativeBackend`]: asks an LLM to synthesize a transform program
//!
//! Stage agents never call a backend directly by name; they ask the
//! [`BackendSelector`] for the ordered candidates covering a task and fall
//! back along that order.

pub mod generative;
pub mod library;
pub mod selector;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::artifact::{Artifact, BackendKind};
use crate::data::Schema;
use crate::error::BackendError;
use crate::task::{StageKind, Task};

pub use generative::{GenerativeBackend, GenerativeConfig};
pub use library::LibraryBackend;
pub use selector::{BackendSelector, FallbackOrder};

/// Everything a backend sees when asked for an artifact.
#[derive(Debug, Clone, Copy)]
pub struct BackendRequest<'a> {
    pub task: &'a Task,
    /// Schema of the task's input data.
    pub input_schema: &'a Schema,
    /// Reasons earlier attempts for this task were rejected, oldest first.
    pub prior_failures: &'a [String],
}

impl<'a> BackendRequest<'a> {
    pub fn new(task: &'a Task, input_schema: &'a Schema) -> Self {
        Self {
            task,
            input_schema,
            prior_failures: &[],
        }
    }

    pub fn with_prior_failures(mut self, failures: &'a [String]) -> Self {
        self.prior_failures = failures;
        self
    }
}

/// A producer of artifacts.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend handles `operation` for `stage` at all.
    fn covers(&self, stage: StageKind, operation: &str) -> bool;

    /// Deterministic backends return the same artifact for the same request,
    /// so retrying one after a failure is pointless.
    fn is_deterministic(&self) -> bool;

    /// Produce an artifact for the request.
    ///
    /// # Errors
    ///
    /// Returns a [`BackendError`] when no artifact can be produced. Callers
    /// must treat `Cancelled` as final for the task.
    async fn produce(
        &self,
        request: BackendRequest<'_>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BackendError>;
}

pub type SharedBackend = Arc<dyn Backend>;
