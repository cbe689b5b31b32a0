//! Transactional outbox and its asynchronous publisher.
//!
//! Events are inserted as PENDING rows (by the batch-commit transaction or
//! directly via [`Outbox::enqueue`]) and a background publisher drains them
//! onto the in-process bus in id order. A failed publish leaves the row
//! PENDING for the next tick, so delivery is at-least-once and handlers
//! must be idempotent.

use super::{DomainEvent, MessageBus};
use crate::db::Database;
use crate::errors::CoreResult;
use metrics::counter;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct Outbox {
    db: Database,
}

impl Outbox {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persists an event as PENDING outside a batch commit. Callers that
    /// commit business state should stage inserts through
    /// `Database::commit_batch_results` instead.
    pub fn enqueue(&self, event: &DomainEvent) -> CoreResult<i64> {
        self.db.enqueue_event(&event.to_outbox_insert()?)
    }
}

pub struct OutboxPublisher {
    db: Database,
    bus: MessageBus,
    poll_interval: Duration,
    batch_size: usize,
}

impl OutboxPublisher {
    pub fn new(db: Database, bus: MessageBus, poll_interval: Duration) -> Self {
        Self {
            db,
            bus,
            poll_interval,
            batch_size: 100,
        }
    }

    /// Drains every currently-pending row once. Returns how many events were
    /// published.
    pub fn publish_pending(&self) -> usize {
        let pending = match self.db.pending_outbox(self.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "outbox scan failed");
                return 0;
            }
        };

        let mut published = 0;
        for row in pending {
            let event = match DomainEvent::from_stored(&row.event_type, &row.payload) {
                Ok(event) => event,
                Err(e) => {
                    // Undeliverable payloads would wedge the queue; mark them
                    // published and keep the error visible in the log.
                    error!(id = row.id, event_type = %row.event_type, error = %e,
                           "outbox row undeserializable, dropping");
                    self.db.mark_outbox_published(row.id).ok();
                    continue;
                }
            };
            match self.bus.publish(event) {
                Ok(_) => match self.db.mark_outbox_published(row.id) {
                    Ok(()) => {
                        counter!("outbox_published_total", 1);
                        published += 1;
                    }
                    Err(e) => {
                        // The event went out but the row stays PENDING; the
                        // next tick republishes it. At-least-once, not
                        // exactly-once.
                        warn!(id = row.id, error = %e, "publish succeeded but mark failed");
                    }
                },
                Err(e) => {
                    warn!(id = row.id, error = %e, "publish failed, row stays pending");
                    break;
                }
            }
        }
        published
    }

    /// Background loop: drain on an interval until shutdown flips.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let published = self.publish_pending();
                        if published > 0 {
                            debug!(published, "outbox drained");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            // Final drain so committed events are not stranded.
                            self.publish_pending();
                            break;
                        }
                    }
                }
            }
        })
    }
}
