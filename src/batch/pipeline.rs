//! Per-batch processing pipeline.
//!
//! One logical pipeline handles each uploaded batch: parse, validate
//! (uniqueness + rules, fanned out across rayon workers over the prepared
//! evaluator), calculate (EUR conversion + portfolio analysis), store the
//! derived artifacts, and commit batch state, violations and outbox events
//! in a single transaction. Stage boundaries check the per-batch deadline;
//! exceeding it fails the batch with TIMEOUT. Quality results of a failed
//! batch are never published.

use super::state::{apply_transition, fail_batch};
use crate::db::Database;
use crate::errors::{CoreError, CoreResult};
use crate::events::{BatchCalculationCompleted, BatchIngested, BatchQualityCompleted, DomainEvent};
use crate::models::{Batch, BatchStatus, Config, ExposureRecord};
use crate::parser::{detect_format, parse_file, ParseMode, ParsedFile};
use crate::risk::{DbRateProvider, PortfolioAnalyzer, RiskCalculator};
use crate::rules::RuleEngine;
use crate::storage::ObjectStoreGateway;
use crate::validation::{QualityScorer, UniquenessValidator};
use chrono::Utc;
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

struct Deadline {
    started: Instant,
    limit: Duration,
}

impl Deadline {
    fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    fn check(&self) -> CoreResult<()> {
        if self.started.elapsed() > self.limit {
            Err(CoreError::timeout(self.started.elapsed().as_secs()))
        } else {
            Ok(())
        }
    }
}

pub struct BatchPipeline {
    db: Database,
    gateway: ObjectStoreGateway,
    engine: Arc<RuleEngine>,
    quality_weights: [Decimal; 6],
    batch_timeout: Duration,
    parse_mode: ParseMode,
}

impl BatchPipeline {
    pub fn new(
        db: Database,
        gateway: ObjectStoreGateway,
        engine: Arc<RuleEngine>,
        config: &Config,
    ) -> Self {
        Self {
            db,
            gateway,
            engine,
            quality_weights: config.quality_weights,
            batch_timeout: config.batch_timeout,
            parse_mode: if std::env::var("PARSER_LENIENT").map(|v| v == "1").unwrap_or(false) {
                ParseMode::Lenient
            } else {
                ParseMode::Strict
            },
        }
    }

    /// Drives one batch to COMPLETED or FAILED. Terminal batches return
    /// unchanged, so redelivered ingestion events are no-ops.
    pub fn process(&self, batch_id: &str) -> CoreResult<Batch> {
        let mut batch = self
            .db
            .get_batch(batch_id)?
            .ok_or_else(|| CoreError::system(format!("unknown batch {batch_id}")))?;
        if batch.status.is_terminal() {
            info!(batch_id, status = batch.status.as_str(), "batch already terminal");
            return Ok(batch);
        }

        let deadline = Deadline::new(self.batch_timeout);
        let result = self.run_stages(&mut batch, &deadline);
        // The exemption cache is batch-scoped either way.
        self.engine.on_batch_complete();

        match result {
            Ok(()) => Ok(batch),
            Err(e) => {
                error!(batch_id, error = %e, "batch failed");
                fail_batch(&mut batch, &e, Utc::now());
                self.db.update_batch(&batch)?;
                Ok(batch)
            }
        }
    }

    fn run_stages(&self, batch: &mut Batch, deadline: &Deadline) -> CoreResult<()> {
        let now = Utc::now();
        apply_transition(batch, BatchStatus::Parsing, now)?;
        self.db.update_batch(batch)?;

        // PARSING
        let object_ref = batch
            .object_ref
            .clone()
            .ok_or_else(|| CoreError::system("batch has no stored artifact"))?;
        let raw = self.gateway.get_object(&object_ref)?;
        let format = detect_format(
            &batch.file_metadata.file_name,
            &batch.file_metadata.content_type,
        )
        .ok_or_else(|| CoreError::parse("unrecognized file format"))?;
        let parsed: ParsedFile = parse_file(format, &raw, self.parse_mode)?;
        batch.exposure_count = parsed.records.len() as i64;
        if !parsed.skipped.is_empty() {
            warn!(
                batch_id = %batch.batch_id,
                skipped = parsed.skipped.len(),
                "lenient parse skipped records"
            );
        }
        deadline.check()?;

        // VALIDATING: uniqueness + rules over the prepared evaluator.
        let observed_at = Utc::now();
        let uniqueness =
            UniquenessValidator::validate(&batch.batch_id, &parsed.records, observed_at);

        self.engine.prefetch_for_batch(&self.db, &parsed.records)?;
        let evaluator = self.engine.prepare_for_batch();
        let evaluations: Vec<_> = parsed
            .records
            .par_iter()
            .map(|record| evaluator.validate_no_persist(&batch.batch_id, record))
            .collect();

        let mut violations = uniqueness.violations.clone();
        let mut eval_stats = crate::rules::EvalStats::default();
        for evaluation in &evaluations {
            violations.extend(evaluation.violations.iter().cloned());
            eval_stats.evaluated += evaluation.stats.evaluated;
            eval_stats.passed += evaluation.stats.passed;
            eval_stats.failed += evaluation.stats.failed;
            eval_stats.exempted += evaluation.stats.exempted;
            eval_stats.errors += evaluation.stats.errors;
        }
        deadline.check()?;

        apply_transition(batch, BatchStatus::Validated, Utc::now())?;
        self.db.update_batch(batch)?;

        // CALCULATING
        let rates = DbRateProvider::new(self.db.clone());
        let default_date = parsed
            .bank_info
            .as_ref()
            .and_then(|info| info.reporting_date)
            .or_else(|| most_common_reporting_date(&parsed.records))
            .unwrap_or_else(|| batch.uploaded_at.date_naive());
        let calculator = RiskCalculator::new(&rates, default_date);
        let calculation = calculator.calculate(&parsed.records, &parsed.crm);
        let portfolio =
            PortfolioAnalyzer::analyze(&batch.batch_id, &calculation.classified, Utc::now());

        let scorer = QualityScorer::new(self.quality_weights);
        let scores = scorer.score(
            &violations,
            parsed.records.len(),
            Some(uniqueness.uniqueness_score),
        );
        deadline.check()?;

        // STORING: derived artifacts.
        apply_transition(batch, BatchStatus::Storing, Utc::now())?;
        self.db.update_batch(batch)?;

        let quality_artifact = serde_json::json!({
            "batchId": batch.batch_id,
            "bankId": batch.bank_id,
            "scores": scores,
            "violations": violations.len(),
            "uniquenessScore": uniqueness.uniqueness_score,
            "evaluation": eval_stats,
        });
        let quality_ref = self.gateway.put_derived(
            &self.gateway.derived_key(&batch.batch_id, "quality.json"),
            &serde_json::to_vec(&quality_artifact)?,
            "application/json",
        )?;

        let record_errors: Vec<serde_json::Value> = calculation
            .errors
            .iter()
            .map(|e| {
                serde_json::json!({
                    "exposureId": e.exposure_id,
                    "code": e.error.code,
                    "detail": e.error.detail,
                })
            })
            .collect();
        let calculation_artifact = serde_json::json!({
            "batchId": batch.batch_id,
            "totalEur": calculation.total_eur(),
            "totalMitigatedEur": calculation
                .classified
                .iter()
                .map(|c| c.mitigated_amount_eur)
                .sum::<Decimal>(),
            "recordErrors": record_errors,
            "portfolio": portfolio,
        });
        let calculation_ref = self.gateway.put_derived(
            &self.gateway.derived_key(&batch.batch_id, "calculation.json"),
            &serde_json::to_vec(&calculation_artifact)?,
            "application/json",
        )?;
        deadline.check()?;

        // COMPLETED: one transaction commits state, violations and events.
        // The in-memory batch flips only after the commit lands, so a commit
        // failure still walks the STORING -> FAILED edge.
        let completed_at = Utc::now();
        let mut completed = batch.clone();
        apply_transition(&mut completed, BatchStatus::Completed, completed_at)?;

        let quality_event = DomainEvent::BatchQualityCompleted(BatchQualityCompleted {
            batch_id: batch.batch_id.clone(),
            bank_id: batch.bank_id.clone(),
            result_uri: quality_ref.uri(),
            quality_scores: scores.clone(),
            timestamp: completed_at,
        });
        let calculation_event =
            DomainEvent::BatchCalculationCompleted(BatchCalculationCompleted {
                batch_id: batch.batch_id.clone(),
                bank_id: batch.bank_id.clone(),
                result_uri: calculation_ref.uri(),
                total_exposures: batch.exposure_count,
                total_amount_eur: calculation.total_eur(),
                completed_at,
            });
        self.db.commit_batch_results(
            &completed,
            &violations,
            &[
                quality_event.to_outbox_insert()?,
                calculation_event.to_outbox_insert()?,
            ],
        )?;
        *batch = completed;

        info!(
            batch_id = %batch.batch_id,
            exposures = batch.exposure_count,
            violations = violations.len(),
            grade = scores.grade.as_str(),
            duration_ms = batch.processing_duration_ms,
            "batch completed"
        );
        Ok(())
    }
}

/// Fallback rate date when no bank header is present: the date most of the
/// records report on.
fn most_common_reporting_date(records: &[ExposureRecord]) -> Option<chrono::NaiveDate> {
    let mut counts = std::collections::HashMap::new();
    for record in records {
        if let Some(date) = record.reporting_date {
            *counts.entry(date).or_insert(0usize) += 1;
        }
    }
    counts.into_iter().max_by_key(|(_, n)| *n).map(|(d, _)| d)
}

/// Job fan-in for the pipeline: ingestion events queue batch ids, a small
/// worker pool drains them.
pub fn spawn_pipeline_workers(
    pipeline: Arc<BatchPipeline>,
    rx: mpsc::Receiver<String>,
    worker_count: usize,
) {
    let shared_rx = Arc::new(Mutex::new(rx));
    for worker in 0..worker_count.max(1) {
        let pipeline = pipeline.clone();
        let rx = shared_rx.clone();
        tokio::spawn(async move {
            loop {
                let job = { rx.lock().await.recv().await };
                let Some(batch_id) = job else {
                    break;
                };
                let pipeline = pipeline.clone();
                let id = batch_id.clone();
                let result =
                    tokio::task::spawn_blocking(move || pipeline.process(&id)).await;
                match result {
                    Ok(Ok(batch)) => {
                        if batch.status == BatchStatus::Failed {
                            warn!(worker, batch_id, "pipeline finished in FAILED");
                        }
                    }
                    Ok(Err(e)) => error!(worker, batch_id, error = %e, "pipeline error"),
                    Err(e) => error!(worker, batch_id, error = %e, "pipeline task panicked"),
                }
            }
        });
    }
}

/// Forwards `BatchIngested` events from the bus into the pipeline queue.
pub fn spawn_ingestion_listener(
    mut bus_rx: tokio::sync::broadcast::Receiver<DomainEvent>,
    queue: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = bus_rx.recv() => match received {
                    Ok(DomainEvent::BatchIngested(BatchIngested { batch_id, .. })) => {
                        if queue.send(batch_id).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "ingestion listener lagged");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ingest::IngestionService;
    use crate::models::QualityGrade;
    use crate::storage::MemoryBackend;
    use rust_decimal_macros::dec;

    struct Fixture {
        db: Database,
        gateway: ObjectStoreGateway,
        pipeline: BatchPipeline,
        ingestion: IngestionService,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory().unwrap();
        let gateway =
            ObjectStoreGateway::new(Arc::new(MemoryBackend::new()), "bucket", "", "secret");
        let engine = Arc::new(RuleEngine::new(true));
        let config = Config::for_test(std::path::Path::new("/tmp/unused"));
        Fixture {
            db: db.clone(),
            gateway: gateway.clone(),
            pipeline: BatchPipeline::new(db.clone(), gateway.clone(), engine, &config),
            ingestion: IngestionService::new(db, gateway),
        }
    }

    const HAPPY_BODY: &[u8] = br#"{
        "bankInfo": {"bankName": "Banca Uno", "bankCode": "08081",
                     "reportingDate": "2025-06-30", "expectedExposureCount": 3},
        "records": [
            {"exposureId": "E1", "counterpartyId": "CP1", "sector": "CORPORATE",
             "countryCode": "IT", "exposureAmount": 500, "currency": "EUR",
             "reportingDate": "2025-06-30"},
            {"exposureId": "E2", "counterpartyId": "CP2", "sector": "BANKING",
             "countryCode": "DE", "exposureAmount": 300, "currency": "EUR",
             "reportingDate": "2025-06-30"},
            {"exposureId": "E3", "counterpartyId": "CP3", "sector": "SOVEREIGN",
             "countryCode": "US", "exposureAmount": 200, "currency": "EUR",
             "reportingDate": "2025-06-30"}
        ]
    }"#;

    #[test]
    fn test_happy_path_completes_with_grade_a_plus() {
        let fx = fixture();
        let batch = fx
            .ingestion
            .submit_batch("08081", HAPPY_BODY, "exposures.json", "application/json")
            .unwrap();

        let done = fx.pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);
        assert_eq!(done.exposure_count, 3);
        assert!(done.completed_at.is_some());

        assert!(fx.db.violations_for_batch(&batch.batch_id).unwrap().is_empty());

        // BatchIngested + quality + calculation events staged.
        let pending = fx.db.pending_outbox(10).unwrap();
        let types: Vec<&str> = pending.iter().map(|r| r.event_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "BatchIngested",
                "BatchQualityCompleted",
                "BatchCalculationCompleted"
            ]
        );

        // Quality artifact reports a perfect grade.
        let quality = pending
            .iter()
            .find(|r| r.event_type == "BatchQualityCompleted")
            .unwrap();
        let event: crate::events::BatchQualityCompleted =
            serde_json::from_str(&quality.payload).unwrap();
        assert_eq!(event.quality_scores.grade, QualityGrade::APlus);
        assert_eq!(event.quality_scores.overall_score, dec!(100));
    }

    #[test]
    fn test_duplicate_exposure_ids_still_complete() {
        let fx = fixture();
        let body = br#"[
            {"exposureId": "E1", "exposureAmount": 100, "currency": "EUR", "countryCode": "IT"},
            {"exposureId": "E1", "exposureAmount": 200, "currency": "EUR", "countryCode": "IT"},
            {"exposureId": "E2", "exposureAmount": 300, "currency": "EUR", "countryCode": "IT"}
        ]"#;
        let batch = fx
            .ingestion
            .submit_batch("08081", body, "dups.json", "application/json")
            .unwrap();
        let done = fx.pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);

        let violations = fx.db.violations_for_batch(&batch.batch_id).unwrap();
        let critical: Vec<_> = violations
            .iter()
            .filter(|v| v.rule_id == "UNIQUENESS_EXPOSURE_ID_DUPLICATE")
            .collect();
        assert_eq!(critical.len(), 2);

        let quality = fx.db.pending_outbox(10).unwrap();
        let event: crate::events::BatchQualityCompleted = serde_json::from_str(
            &quality
                .iter()
                .find(|r| r.event_type == "BatchQualityCompleted")
                .unwrap()
                .payload,
        )
        .unwrap();
        assert_eq!(
            event
                .quality_scores
                .dimension_scores
                .get("UNIQUENESS")
                .copied()
                .unwrap(),
            dec!(33.33)
        );
    }

    #[test]
    fn test_fx_missing_record_excluded_but_batch_completes() {
        let fx = fixture();
        let body = br#"[
            {"exposureId": "E1", "exposureAmount": 100, "currency": "EUR",
             "countryCode": "IT", "reportingDate": "2025-06-30"},
            {"exposureId": "E2", "exposureAmount": 999, "currency": "ZZZ",
             "countryCode": "IT", "reportingDate": "2025-06-30"}
        ]"#;
        let batch = fx
            .ingestion
            .submit_batch("08081", body, "fx.json", "application/json")
            .unwrap();
        let done = fx.pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);

        let pending = fx.db.pending_outbox(10).unwrap();
        let calc: crate::events::BatchCalculationCompleted = serde_json::from_str(
            &pending
                .iter()
                .find(|r| r.event_type == "BatchCalculationCompleted")
                .unwrap()
                .payload,
        )
        .unwrap();
        // Totals exclude the record without a rate.
        assert_eq!(calc.total_amount_eur, dec!(100.00));

        // The record error is visible in the calculation artifact.
        let artifact = fx
            .gateway
            .get_object(
                &crate::models::ObjectRef::from_uri(&calc.result_uri).unwrap(),
            )
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&artifact).unwrap();
        assert_eq!(value["recordErrors"].as_array().unwrap().len(), 1);
        assert_eq!(value["recordErrors"][0]["code"], "FX_RATE_UNAVAILABLE");
    }

    #[test]
    fn test_malformed_file_fails_batch() {
        let fx = fixture();
        let batch = fx
            .ingestion
            .submit_batch("08081", b"{not json", "bad.json", "application/json")
            .unwrap();
        let done = fx.pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Failed);
        assert!(done.error_message.as_deref().unwrap().contains("PARSE_ERROR"));

        // No quality or calculation events for a failed batch.
        let pending = fx.db.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "BatchIngested");
    }

    #[test]
    fn test_rule_violations_flow_into_scores() {
        let fx = fixture();
        fx.db
            .insert_rule(&crate::models::BusinessRule {
                rule_id: "AMOUNT_POSITIVE".to_string(),
                enabled: true,
                expression: "exposure_amount > 0".to_string(),
                dimension: crate::models::QualityDimension::Validity,
                severity: crate::models::RuleSeverity::Critical,
                field: Some("exposure_amount".to_string()),
                message: "exposure amount must be positive".to_string(),
            })
            .unwrap();

        let body = br#"[
            {"exposureId": "E1", "exposureAmount": 0, "currency": "EUR", "countryCode": "IT"},
            {"exposureId": "E2", "exposureAmount": 10, "currency": "EUR", "countryCode": "IT"}
        ]"#;
        let batch = fx
            .ingestion
            .submit_batch("08081", body, "rules.json", "application/json")
            .unwrap();
        fx.pipeline.process(&batch.batch_id).unwrap();

        let violations = fx.db.violations_for_batch(&batch.batch_id).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, "AMOUNT_POSITIVE");
        assert_eq!(violations[0].exposure_id, "E1");
    }

    #[test]
    fn test_zero_timeout_fails_with_timeout() {
        let fx = fixture();
        let batch = fx
            .ingestion
            .submit_batch("08081", HAPPY_BODY, "exposures.json", "application/json")
            .unwrap();

        let mut config = Config::for_test(std::path::Path::new("/tmp/unused"));
        config.batch_timeout = Duration::from_secs(0);
        let pipeline = BatchPipeline::new(
            fx.db.clone(),
            fx.gateway.clone(),
            Arc::new(RuleEngine::new(true)),
            &config,
        );
        let done = pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Failed);
        assert!(done.error_message.as_deref().unwrap().contains("TIMEOUT"));
    }

    #[test]
    fn test_terminal_batch_is_idempotent() {
        let fx = fixture();
        let batch = fx
            .ingestion
            .submit_batch("08081", HAPPY_BODY, "exposures.json", "application/json")
            .unwrap();
        fx.pipeline.process(&batch.batch_id).unwrap();
        let before = fx.db.pending_outbox(100).unwrap().len();
        // Reprocessing a COMPLETED batch changes nothing.
        let again = fx.pipeline.process(&batch.batch_id).unwrap();
        assert_eq!(again.status, BatchStatus::Completed);
        assert_eq!(fx.db.pending_outbox(100).unwrap().len(), before);
    }
}
