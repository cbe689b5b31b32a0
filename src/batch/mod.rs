//! Batch lifecycle: submission, state machine and the processing pipeline.

pub mod ingest;
pub mod pipeline;
pub mod state;

pub use ingest::IngestionService;
pub use pipeline::{spawn_ingestion_listener, spawn_pipeline_workers, BatchPipeline};
pub use state::{apply_transition, fail_batch, validate_transition};
