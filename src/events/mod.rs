//! Domain events, their wire shapes and the in-process message bus.
//!
//! Every event is persisted to the outbox inside the transaction that
//! commits the business state it describes, then published asynchronously.
//! Handlers are idempotent; delivery is at-least-once.

pub mod coordinator;
pub mod failure_queue;
pub mod outbox;

pub use coordinator::{CoordinationOutcome, ReportCoordinator};
pub use failure_queue::{FailureHandler, FailureQueue, FailureProcessor, HandlerRegistry};
pub use outbox::{Outbox, OutboxPublisher};

use crate::db::OutboxInsert;
use crate::errors::{CoreError, CoreResult};
use crate::models::{ObjectRef, QualityScores};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchIngested {
    pub batch_id: String,
    pub bank_id: String,
    pub object_ref: ObjectRef,
    pub exposure_count: i64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchQualityCompleted {
    pub batch_id: String,
    pub bank_id: String,
    pub result_uri: String,
    pub quality_scores: QualityScores,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCalculationCompleted {
    pub batch_id: String,
    pub bank_id: String,
    pub result_uri: String,
    pub total_exposures: i64,
    pub total_amount_eur: Decimal,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportArtifact {
    pub format: String,
    pub object_ref: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerated {
    pub batch_id: String,
    pub report_id: String,
    pub artifacts: Vec<ReportArtifact>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventProcessingPermanentlyFailed {
    pub failure_id: String,
    pub event_type: String,
    pub retry_count: u32,
    pub last_error: String,
}

/// Everything the bus carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    BatchIngested(BatchIngested),
    BatchQualityCompleted(BatchQualityCompleted),
    BatchCalculationCompleted(BatchCalculationCompleted),
    ReportGenerated(ReportGenerated),
    EventProcessingPermanentlyFailed(EventProcessingPermanentlyFailed),
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::BatchIngested(_) => "BatchIngested",
            DomainEvent::BatchQualityCompleted(_) => "BatchQualityCompleted",
            DomainEvent::BatchCalculationCompleted(_) => "BatchCalculationCompleted",
            DomainEvent::ReportGenerated(_) => "ReportGenerated",
            DomainEvent::EventProcessingPermanentlyFailed(_) => {
                "EventProcessingPermanentlyFailed"
            }
        }
    }

    /// Serializes the inner wire shape (not the enum wrapper) for storage.
    pub fn payload_json(&self) -> CoreResult<String> {
        let json = match self {
            DomainEvent::BatchIngested(e) => serde_json::to_string(e)?,
            DomainEvent::BatchQualityCompleted(e) => serde_json::to_string(e)?,
            DomainEvent::BatchCalculationCompleted(e) => serde_json::to_string(e)?,
            DomainEvent::ReportGenerated(e) => serde_json::to_string(e)?,
            DomainEvent::EventProcessingPermanentlyFailed(e) => serde_json::to_string(e)?,
        };
        Ok(json)
    }

    pub fn to_outbox_insert(&self) -> CoreResult<OutboxInsert> {
        Ok(OutboxInsert {
            event_type: self.event_type().to_string(),
            payload: self.payload_json()?,
        })
    }

    /// Rehydrates an event from an outbox row.
    pub fn from_stored(event_type: &str, payload: &str) -> CoreResult<Self> {
        Ok(match event_type {
            "BatchIngested" => DomainEvent::BatchIngested(serde_json::from_str(payload)?),
            "BatchQualityCompleted" => {
                DomainEvent::BatchQualityCompleted(serde_json::from_str(payload)?)
            }
            "BatchCalculationCompleted" => {
                DomainEvent::BatchCalculationCompleted(serde_json::from_str(payload)?)
            }
            "ReportGenerated" => DomainEvent::ReportGenerated(serde_json::from_str(payload)?),
            "EventProcessingPermanentlyFailed" => {
                DomainEvent::EventProcessingPermanentlyFailed(serde_json::from_str(payload)?)
            }
            other => {
                return Err(CoreError::system(format!("unknown event type '{other}'")))
            }
        })
    }
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

/// Broadcast bus carrying published domain events to subscribed handlers.
/// A keepalive receiver is held so publishing never fails for lack of
/// subscribers; late subscribers simply miss earlier events, which the
/// outbox's at-least-once retry covers.
#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl MessageBus {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<DomainEvent>) {
        let (tx, keepalive) = broadcast::channel(capacity.max(16));
        (Self { tx }, keepalive)
    }

    pub fn publish(&self, event: DomainEvent) -> CoreResult<usize> {
        self.tx
            .send(event)
            .map_err(|e| CoreError::system(format!("bus publish: {e}")))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_round_trip_through_storage_shape() {
        let event = DomainEvent::BatchCalculationCompleted(BatchCalculationCompleted {
            batch_id: "b1".to_string(),
            bank_id: "08081".to_string(),
            result_uri: "regflow://bucket/derived/b1/calc.json?v=x".to_string(),
            total_exposures: 3,
            total_amount_eur: rust_decimal_macros::dec!(1500.25),
            completed_at: Utc::now(),
        });
        let insert = event.to_outbox_insert().unwrap();
        assert_eq!(insert.event_type, "BatchCalculationCompleted");
        // Wire shape uses camelCase keys.
        assert!(insert.payload.contains("\"batchId\""));
        assert!(insert.payload.contains("\"totalAmountEur\""));

        let rehydrated = DomainEvent::from_stored(&insert.event_type, &insert.payload).unwrap();
        match rehydrated {
            DomainEvent::BatchCalculationCompleted(e) => {
                assert_eq!(e.batch_id, "b1");
                assert_eq!(e.total_exposures, 3);
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        assert!(DomainEvent::from_stored("Mystery", "{}").is_err());
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let (bus, _keepalive) = MessageBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(DomainEvent::EventProcessingPermanentlyFailed(
            EventProcessingPermanentlyFailed {
                failure_id: "f1".to_string(),
                event_type: "X".to_string(),
                retry_count: 5,
                last_error: "boom".to_string(),
            },
        ))
        .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "EventProcessingPermanentlyFailed");
    }
}
