//! Persistent failure queue with exponential-backoff retry.
//!
//! Event handlers that fail convert their error into a PENDING row here.
//! A scheduled processor re-dispatches due rows to registered handlers;
//! each failed attempt pushes the row further out on the backoff schedule
//! until the retry budget is exhausted, at which point the row goes to
//! DEAD_LETTER and an `EventProcessingPermanentlyFailed` event is emitted
//! for operator attention. Handlers must be idempotent; the processor does
//! not deduplicate.

use super::{DomainEvent, EventProcessingPermanentlyFailed, Outbox};
use crate::db::{Database, EventFailureRow, FailureStatus};
use crate::errors::CoreResult;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Handles one failed-event type during retry processing.
pub trait FailureHandler: Send + Sync {
    fn handle(&self, payload_json: &str) -> anyhow::Result<()>;
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn FailureHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: impl Into<String>, handler: Arc<dyn FailureHandler>) {
        self.handlers.insert(event_type.into(), handler);
    }

    fn get(&self, event_type: &str) -> Option<&Arc<dyn FailureHandler>> {
        self.handlers.get(event_type)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingStats {
    pub dispatched: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

#[derive(Clone)]
pub struct FailureQueue {
    db: Database,
    outbox: Outbox,
    default_max_retries: u32,
    backoff: Vec<Duration>,
}

impl FailureQueue {
    pub fn new(
        db: Database,
        outbox: Outbox,
        default_max_retries: u32,
        backoff: Vec<Duration>,
    ) -> Self {
        Self {
            db,
            outbox,
            default_max_retries,
            backoff,
        }
    }

    /// Records a failed event for later retry. Returns the row id.
    pub fn save_failure(
        &self,
        event_type: &str,
        payload_json: &str,
        error_message: &str,
        error_stack: Option<&str>,
        max_retries: Option<u32>,
    ) -> CoreResult<String> {
        let now = Utc::now();
        let row = EventFailureRow {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            event_payload: payload_json.to_string(),
            error_message: error_message.to_string(),
            error_stack: error_stack.map(str::to_string),
            retry_count: 0,
            max_retries: max_retries.unwrap_or(self.default_max_retries),
            status: FailureStatus::Pending,
            next_retry_at: now,
            created_at: now,
            processed_at: None,
            failed_at: None,
        };
        self.db.insert_failure(&row)?;
        counter!("failure_queue_saved_total", 1);
        warn!(id = %row.id, event_type, error = error_message, "failure queued for retry");
        Ok(row.id)
    }

    /// One scheduled pass: claim due rows oldest-first and dispatch each to
    /// its registered handler.
    pub fn process_due(
        &self,
        registry: &HandlerRegistry,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ProcessingStats {
        let mut stats = ProcessingStats::default();
        let due = match self.db.due_failures(now, limit) {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "failure-queue scan failed");
                return stats;
            }
        };

        for row in due {
            match self.db.claim_failure(&row.id) {
                Ok(true) => {}
                Ok(false) => continue, // lost the claim race
                Err(e) => {
                    error!(id = %row.id, error = %e, "failure claim failed");
                    continue;
                }
            }
            stats.dispatched += 1;

            let outcome = match registry.get(&row.event_type) {
                Some(handler) => handler.handle(&row.event_payload),
                None => Err(anyhow::anyhow!(
                    "no handler registered for '{}'",
                    row.event_type
                )),
            };

            match outcome {
                Ok(()) => {
                    if let Err(e) = self.db.mark_failure_succeeded(&row.id) {
                        error!(id = %row.id, error = %e, "failed to mark success");
                    } else {
                        stats.succeeded += 1;
                        info!(id = %row.id, event_type = %row.event_type, "failure retried successfully");
                    }
                }
                Err(handler_error) => {
                    let retry_count = row.retry_count + 1;
                    if retry_count > row.max_retries {
                        self.dead_letter(&row, retry_count, &handler_error.to_string());
                        stats.dead_lettered += 1;
                    } else {
                        let delay = self.backoff_delay(retry_count);
                        let next = now
                            + ChronoDuration::from_std(delay)
                                .unwrap_or_else(|_| ChronoDuration::seconds(60));
                        if let Err(e) = self.db.reschedule_failure(
                            &row.id,
                            retry_count,
                            &handler_error.to_string(),
                            next,
                        ) {
                            error!(id = %row.id, error = %e, "failed to reschedule");
                        } else {
                            counter!("failure_queue_retries_total", 1);
                            stats.rescheduled += 1;
                            warn!(
                                id = %row.id,
                                retry_count,
                                next_retry_at = %next,
                                error = %handler_error,
                                "failure rescheduled"
                            );
                        }
                    }
                }
            }
        }
        stats
    }

    /// Retry `n` waits on schedule entry `n-1`; past the end the last entry
    /// repeats.
    fn backoff_delay(&self, retry_count: u32) -> Duration {
        let index = (retry_count.saturating_sub(1)) as usize;
        self.backoff
            .get(index)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(Duration::from_secs(60))
    }

    fn dead_letter(&self, row: &EventFailureRow, retry_count: u32, last_error: &str) {
        if let Err(e) = self.db.mark_failure_dead(&row.id, last_error) {
            error!(id = %row.id, error = %e, "failed to dead-letter");
            return;
        }
        counter!("failure_queue_dead_letter_total", 1);
        error!(
            id = %row.id,
            event_type = %row.event_type,
            retry_count,
            "retry budget exhausted, dead-lettered"
        );
        let event =
            DomainEvent::EventProcessingPermanentlyFailed(EventProcessingPermanentlyFailed {
                failure_id: row.id.clone(),
                event_type: row.event_type.clone(),
                retry_count,
                last_error: last_error.to_string(),
            });
        if let Err(e) = self.outbox.enqueue(&event) {
            error!(id = %row.id, error = %e, "failed to emit permanent-failure event");
        }
    }
}

/// Background processor ticking the queue on a fixed interval.
pub struct FailureProcessor {
    queue: FailureQueue,
    registry: HandlerRegistry,
    interval: Duration,
}

impl FailureProcessor {
    pub fn new(queue: FailureQueue, registry: HandlerRegistry, interval: Duration) -> Self {
        Self {
            queue,
            registry,
            interval,
        }
    }

    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.queue.process_due(&self.registry, Utc::now(), 50);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
