//! Capability matching and fallback ordering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::SharedBackend;
use crate::artifact::BackendKind;
use crate::task::StageKind;

/// Which backend kind is tried first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackOrder {
    #[default]
    LibraryFirst,
    GenerativeFirst,
}

impl FallbackOrder {
    fn rank(&self, kind: BackendKind) -> u8 {
        match (self, kind) {
            (FallbackOrder::LibraryFirst, BackendKind::Library)
            | (FallbackOrder::GenerativeFirst, BackendKind::Generative) => 0,
            _ => 1,
        }
    }
}

impl std::str::FromStr for FallbackOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "library_first" | "library" => Ok(FallbackOrder::LibraryFirst),
            "generative_first" | "generative" => Ok(FallbackOrder::GenerativeFirst),
            other => Err(format!("unknown fallback order '{}'", other)),
        }
    }
}

/// Holds the registered backends and orders them per task.
#[derive(Clone, Default)]
pub struct BackendSelector {
    backends: Vec<SharedBackend>,
    default_order: FallbackOrder,
    overrides: HashMap<StageKind, FallbackOrder>,
}

impl BackendSelector {
    pub fn new(default_order: FallbackOrder) -> Self {
        Self {
            backends: Vec::new(),
            default_order,
            overrides: HashMap::new(),
        }
    }

    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backends.push(backend);
        self
    }

    /// Use `order` for `stage` instead of the default.
    pub fn with_override(mut self, stage: StageKind, order: FallbackOrder) -> Self {
        self.overrides.insert(stage, order);
        self
    }

    pub fn order_for(&self, stage: StageKind) -> FallbackOrder {
        self.overrides
            .get(&stage)
            .copied()
            .unwrap_or(self.default_order)
    }

    /// Backends covering (stage, operation), best first.
    ///
    /// Registration order breaks ties between backends of the same kind.
    pub fn candidates(&self, stage: StageKind, operation: &str) -> Vec<SharedBackend> {
        let order = self.order_for(stage);
        let mut matching: Vec<SharedBackend> = self
            .backends
            .iter()
            .filter(|b| b.covers(stage, operation))
            .cloned()
            .collect();
        matching.sort_by_key(|b| order.rank(b.kind()));
        matching
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}
