//! Batch data-quality validation: duplicate detection and dimension scoring.

pub mod quality;
pub mod uniqueness;

pub use quality::{QualityScorer, SEVERITY_WEIGHT_CRITICAL};
pub use uniqueness::{UniquenessReport, UniquenessValidator, CONTENT_HASH_VERSION};
