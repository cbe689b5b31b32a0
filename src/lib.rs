//! Regflow Backend Library
//!
//! Exposes the processing core for the binary and the integration tests.

pub mod api;
pub mod batch;
pub mod db;
pub mod errors;
pub mod events;
pub mod models;
pub mod parser;
pub mod report;
pub mod risk;
pub mod rules;
pub mod storage;
pub mod validation;

// Re-export the most commonly wired types for convenience.
pub use batch::{BatchPipeline, IngestionService};
pub use db::Database;
pub use events::{MessageBus, OutboxPublisher, ReportCoordinator};
pub use models::Config;
pub use rules::RuleEngine;
pub use storage::ObjectStoreGateway;
