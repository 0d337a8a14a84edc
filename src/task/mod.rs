//! Task model: stage kinds, fingerprints, statuses and execution results.

pub mod fingerprint;
pub mod types;

pub use fingerprint::{sha256_hex, to_canonical_json, Fingerprint};
pub use types::{ExecutionResult, IoScope, StageKind, Task, TaskStatus};
