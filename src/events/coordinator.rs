//! Report coordinator: joins the quality and calculation streams per batch.
//!
//! The first of the two events parks the batch in an AWAITING state; the
//! second triggers report generation. Events are filtered before any state
//! change: structurally invalid events are counted and dropped, events older
//! than the stale threshold are rejected, and a batch whose report is
//! already COMPLETED is skipped. An in-flight set guards against concurrent
//! duplicate deliveries; generation failures land in the failure queue and
//! the entry is removed so a retry can proceed.

use super::failure_queue::FailureQueue;
use super::{
    BatchCalculationCompleted, BatchQualityCompleted, DomainEvent, Outbox, ReportGenerated,
};
use crate::db::Database;
use crate::models::ReportFormat;
use crate::report::ReportGenerator;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What happened to one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationOutcome {
    AwaitingQuality,
    AwaitingCalculation,
    Joined { report_id: String },
    JoinFailed,
    FilteredInvalid,
    FilteredStale,
    IdempotentSkip,
    Ignored,
}

#[derive(Default)]
struct JoinState {
    quality: Option<BatchQualityCompleted>,
    calculation: Option<BatchCalculationCompleted>,
}

/// Payload written to the failure queue when generation fails, so the retry
/// handler can re-run the join.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReportGenerationRequest {
    pub quality: BatchQualityCompleted,
    pub calculation: BatchCalculationCompleted,
}

pub const REPORT_GENERATION_EVENT_TYPE: &str = "ReportGenerationRequested";

pub struct ReportCoordinator {
    db: Database,
    generator: ReportGenerator,
    outbox: Outbox,
    failure_queue: FailureQueue,
    formats: Vec<ReportFormat>,
    stale_threshold: ChronoDuration,
    joins: Mutex<HashMap<String, JoinState>>,
    in_flight: Mutex<HashSet<String>>,
}

impl ReportCoordinator {
    pub fn new(
        db: Database,
        generator: ReportGenerator,
        outbox: Outbox,
        failure_queue: FailureQueue,
        formats: Vec<ReportFormat>,
        stale_threshold_hours: i64,
    ) -> Self {
        Self {
            db,
            generator,
            outbox,
            failure_queue,
            formats,
            stale_threshold: ChronoDuration::hours(stale_threshold_hours.max(1)),
            joins: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn handle_event(&self, event: &DomainEvent, now: DateTime<Utc>) -> CoordinationOutcome {
        match event {
            DomainEvent::BatchQualityCompleted(quality) => {
                self.handle_quality(quality.clone(), now)
            }
            DomainEvent::BatchCalculationCompleted(calculation) => {
                self.handle_calculation(calculation.clone(), now)
            }
            _ => CoordinationOutcome::Ignored,
        }
    }

    fn handle_quality(
        &self,
        event: BatchQualityCompleted,
        now: DateTime<Utc>,
    ) -> CoordinationOutcome {
        if event.batch_id.trim().is_empty()
            || event.bank_id.trim().is_empty()
            || event.result_uri.trim().is_empty()
        {
            return self.filtered_invalid("BatchQualityCompleted");
        }
        if let Some(outcome) = self.common_filters(&event.batch_id, event.timestamp, now) {
            return outcome;
        }

        let batch_id = event.batch_id.clone();
        let joined = {
            let mut joins = self.joins.lock();
            let state = joins.entry(batch_id.clone()).or_default();
            state.quality = Some(event);
            let complete = state.calculation.is_some();
            if complete {
                joins.remove(&batch_id)
            } else {
                None
            }
        };

        match joined {
            Some(state) => self.join(state, now),
            None => CoordinationOutcome::AwaitingCalculation,
        }
    }

    fn handle_calculation(
        &self,
        event: BatchCalculationCompleted,
        now: DateTime<Utc>,
    ) -> CoordinationOutcome {
        if event.batch_id.trim().is_empty()
            || event.bank_id.trim().is_empty()
            || event.result_uri.trim().is_empty()
        {
            return self.filtered_invalid("BatchCalculationCompleted");
        }
        if let Some(outcome) = self.common_filters(&event.batch_id, event.completed_at, now) {
            return outcome;
        }

        let batch_id = event.batch_id.clone();
        let joined = {
            let mut joins = self.joins.lock();
            let state = joins.entry(batch_id.clone()).or_default();
            state.calculation = Some(event);
            let complete = state.quality.is_some();
            if complete {
                joins.remove(&batch_id)
            } else {
                None
            }
        };

        match joined {
            Some(state) => self.join(state, now),
            None => CoordinationOutcome::AwaitingQuality,
        }
    }

    fn filtered_invalid(&self, event_type: &str) -> CoordinationOutcome {
        counter!("coordinator_filtered_total", 1, "reason" => "invalid");
        warn!(event_type, "event filtered: missing identifiers or uri");
        CoordinationOutcome::FilteredInvalid
    }

    /// Stale + idempotency filters shared by both streams. `None` means the
    /// event may proceed.
    fn common_filters(
        &self,
        batch_id: &str,
        event_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<CoordinationOutcome> {
        if now - event_time > self.stale_threshold {
            counter!("coordinator_filtered_total", 1, "reason" => "stale");
            warn!(batch_id, age_hours = (now - event_time).num_hours(), "event filtered: stale");
            return Some(CoordinationOutcome::FilteredStale);
        }
        match self.db.completed_report_exists(batch_id) {
            Ok(true) => {
                counter!("coordinator_filtered_total", 1, "reason" => "idempotent");
                info!(batch_id, "report already completed, skipping");
                Some(CoordinationOutcome::IdempotentSkip)
            }
            Ok(false) => None,
            Err(e) => {
                error!(batch_id, error = %e, "idempotency lookup failed");
                Some(CoordinationOutcome::JoinFailed)
            }
        }
    }

    fn join(&self, state: JoinState, now: DateTime<Utc>) -> CoordinationOutcome {
        let (Some(quality), Some(calculation)) = (state.quality, state.calculation) else {
            return CoordinationOutcome::JoinFailed;
        };
        let batch_id = quality.batch_id.clone();

        // Process-local in-flight guard against concurrent duplicates.
        if !self.in_flight.lock().insert(batch_id.clone()) {
            counter!("coordinator_filtered_total", 1, "reason" => "in_flight");
            return CoordinationOutcome::IdempotentSkip;
        }

        let outcome = self.generate_report(&quality, &calculation, now);
        if !matches!(outcome, CoordinationOutcome::Joined { .. }) {
            // Drop the guard so a retry can proceed.
            self.in_flight.lock().remove(&batch_id);
        }
        outcome
    }

    fn generate_report(
        &self,
        quality: &BatchQualityCompleted,
        calculation: &BatchCalculationCompleted,
        now: DateTime<Utc>,
    ) -> CoordinationOutcome {
        let batch_id = quality.batch_id.clone();
        let report_id = format!("rpt-{}", uuid::Uuid::new_v4().simple());
        if let Err(e) = self.db.insert_report_pending(&report_id, &batch_id) {
            error!(batch_id, error = %e, "failed to record pending report");
            return CoordinationOutcome::JoinFailed;
        }

        match self.generator.generate(&self.formats, quality, calculation) {
            Ok(artifacts) => {
                let artifacts_json = match serde_json::to_string(&artifacts) {
                    Ok(json) => json,
                    Err(e) => {
                        error!(batch_id, error = %e, "failed to serialize artifacts");
                        return CoordinationOutcome::JoinFailed;
                    }
                };
                if let Err(e) = self.db.mark_report_completed(&report_id, &artifacts_json) {
                    error!(batch_id, error = %e, "failed to mark report completed");
                    return CoordinationOutcome::JoinFailed;
                }
                let event = DomainEvent::ReportGenerated(ReportGenerated {
                    batch_id: batch_id.clone(),
                    report_id: report_id.clone(),
                    artifacts,
                    completed_at: now,
                });
                if let Err(e) = self.outbox.enqueue(&event) {
                    error!(batch_id, error = %e, "failed to enqueue ReportGenerated");
                }
                counter!("coordinator_reports_total", 1);
                info!(batch_id, report_id, "report generated");
                CoordinationOutcome::Joined { report_id }
            }
            Err(e) => {
                // The coordinator does not retry; the failure queue does.
                error!(batch_id, error = %e, "report generation failed");
                self.db.mark_report_failed(&report_id).ok();
                let request = ReportGenerationRequest {
                    quality: quality.clone(),
                    calculation: calculation.clone(),
                };
                match serde_json::to_string(&request) {
                    Ok(payload) => {
                        self.failure_queue
                            .save_failure(
                                REPORT_GENERATION_EVENT_TYPE,
                                &payload,
                                &e.to_string(),
                                None,
                                None,
                            )
                            .ok();
                    }
                    Err(serde_error) => {
                        error!(batch_id, error = %serde_error, "failed to serialize retry payload");
                    }
                }
                CoordinationOutcome::JoinFailed
            }
        }
    }

    /// Background task consuming the bus.
    pub fn spawn(
        self: std::sync::Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<DomainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(event) => {
                            self.handle_event(&event, Utc::now());
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "coordinator lagged behind the bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
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

/// Failure-queue handler that re-runs a failed report generation.
pub struct ReportRetryHandler {
    coordinator: std::sync::Arc<ReportCoordinator>,
}

impl ReportRetryHandler {
    pub fn new(coordinator: std::sync::Arc<ReportCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl super::failure_queue::FailureHandler for ReportRetryHandler {
    fn handle(&self, payload_json: &str) -> anyhow::Result<()> {
        let request: ReportGenerationRequest = serde_json::from_str(payload_json)?;
        let now = Utc::now();
        match self
            .coordinator
            .generate_report(&request.quality, &request.calculation, now)
        {
            CoordinationOutcome::Joined { .. } => Ok(()),
            other => anyhow::bail!("report retry did not complete: {other:?}"),
        }
    }
}
