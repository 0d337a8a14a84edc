//! Deterministic task fingerprints and content hashes.
//!
//! Both are SHA-256 digests over canonical JSON: object keys sorted, no
//! insignificant whitespace. Two tasks that differ only in the key order of
//! their parameters therefore share a fingerprint.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::types::StageKind;
use crate::data::DataRef;

/// Cacheable identity of a task: hash of stage + input + operation + parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a task identity.
    pub fn compute(stage: StageKind, input: &DataRef, operation: &str, params: &Value) -> Self {
        let identity = serde_json::json!({
            "stage": stage.as_str(),
            "input": input.as_str(),
            "operation": operation,
            "params": params,
        });
        Self(sha256_hex(&to_canonical_json(&identity)))
    }

    /// Wrap an existing hex digest (e.g. one typed by an operator).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 chars, for log lines. Operator-typed values need not be hex,
    /// so the cut lands on a char boundary.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hex-encoded SHA-256 of `content`.
pub fn sha256_hex(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize `value` with object keys sorted at every level.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> =
                map.iter().map(|(k, v)| (k, to_canonical_json(v))).collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        scalar => scalar.to_string(),
    }
}
