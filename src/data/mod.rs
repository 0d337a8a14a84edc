//! Tabular data, schema descriptors, quality scoring and blob persistence.
//!
//! The engine treats upstream data as an opaque [`DataRef`] into a
//! [`BlobStore`]; stage agents and the executor decode it into a [`Dataset`]
//! only when they need to look at cells.

pub mod dataset;
pub mod quality;
pub mod store;

pub use dataset::{DataType, Dataset, Field, Schema};
pub use quality::QualityMetrics;
pub use store::{
    load_dataset, save_dataset, BlobStore, DataRef, MemoryBlobStore, RedisBlobStore,
    SharedBlobStore,
};
