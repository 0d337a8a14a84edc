//! Metrics module for Prometheus-based monitoring.
//!
//! Collects cache, backend, validation, execution, LLM and stage-health
//! metrics and exports them in the Prometheus text format.
//!
//! # Example
//!
//! ```ignore
//! use sciforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_task("cleaning", "executed", 0.8);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, TokenUsage};
pub use prometheus::{export_metrics, init_metrics, REGISTRY};
