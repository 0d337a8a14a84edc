//! Artifacts: executable units produced by a capability backend.
//!
//! An artifact wraps a [`TransformProgram`] together with its provenance
//! (which backend produced it, the raw synthesized text if any) and its
//! validation state. Once validated an artifact is frozen and shared through
//! `Arc` from the cache.

pub mod analytics;
pub mod interpreter;
pub mod program;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use interpreter::{run_program, RunControl, Sources};
pub use program::{
    Capability, DatetimePart, Expr, FillStrategy, JoinKind, Step, TransformProgram,
};

/// Which backend produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Library,
    Generative,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Library => write!(f, "library"),
            BackendKind::Generative => write!(f, "generative"),
        }
    }
}

/// Validation state of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ValidationState {
    Unchecked,
    Valid,
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub source: BackendKind,
    pub program: TransformProgram,
    /// Raw text returned by a generative backend.
    #[serde(default)]
    pub source_text: Option<String>,
    /// Free-form explanation returned alongside the program.
    #[serde(default)]
    pub rationale: Option<String>,
    /// SHA-256 of the canonical program.
    pub content_hash: String,
    pub validation: ValidationState,
    pub produced_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(source: BackendKind, program: TransformProgram) -> Self {
        let content_hash = program.content_hash();
        Self {
            id: Uuid::new_v4(),
            source,
            program,
            source_text: None,
            rationale: None,
            content_hash,
            validation: ValidationState::Unchecked,
            produced_at: Utc::now(),
        }
    }

    pub fn with_source_text(mut self, text: impl Into<String>) -> Self {
        self.source_text = Some(text.into());
        self
    }

    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.validation == ValidationState::Valid
    }

    /// Record a verdict. A validated artifact keeps its state.
    pub fn mark(&mut self, state: ValidationState) {
        if !self.is_valid() {
            self.validation = state;
        }
    }
}
