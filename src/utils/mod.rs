//! Shared helpers for reading model responses.

pub mod json_extraction;

pub use json_extraction::{
    extract_code, extract_json_object, fenced_block, find_matching_brace, strip_fences,
    JsonExtractionError,
};
