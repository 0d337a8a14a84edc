//! Shared utility functions for sciforge.

pub mod json_extraction;

pub use json_extraction::{
    analyze_json_structure, extract_from_code_block, extract_last_json_object,
    find_matching_brace, try_extract_json_object, JsonExtractionError, JsonExtractionResult,
    JsonStructureAnalysis,
};
