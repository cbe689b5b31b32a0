//! SQLite persistence layer.
//!
//! One database file holds every table: batches, rules, exemptions,
//! violations, the event outbox, the failure queue, reports and FX rates.
//! WAL mode keeps reads concurrent with writes; hot statements go through
//! the prepared-statement cache; multi-row writes use a single
//! `BEGIN IMMEDIATE` transaction.

use crate::errors::{CoreError, CoreResult};
use crate::models::{
    Batch, BatchStatus, BusinessRule, Exemption, FileMetadata, ObjectRef, QualityDimension,
    RuleSeverity, RuleViolation,
};
use crate::rules::RuleSource;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Row models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
    DeadLetter,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Pending => "PENDING",
            FailureStatus::Processing => "PROCESSING",
            FailureStatus::Succeeded => "SUCCEEDED",
            FailureStatus::Failed => "FAILED",
            FailureStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(FailureStatus::Pending),
            "PROCESSING" => Some(FailureStatus::Processing),
            "SUCCEEDED" => Some(FailureStatus::Succeeded),
            "FAILED" => Some(FailureStatus::Failed),
            "DEAD_LETTER" => Some(FailureStatus::DeadLetter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFailureRow {
    pub id: String,
    pub event_type: String,
    pub event_payload: String,
    pub error_message: String,
    pub error_stack: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: FailureStatus,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OutboxRow {
    pub id: i64,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Outbox insert staged inside a batch-commit transaction.
#[derive(Debug, Clone)]
pub struct OutboxInsert {
    pub event_type: String,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub report_id: String,
    pub batch_id: String,
    pub status: String,
    pub artifacts_json: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &str) -> CoreResult<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::system(format!("open database {db_path}: {e}")))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; used by tests.
    pub fn in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::system(format!("open in-memory database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> CoreResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                bank_id TEXT NOT NULL,
                status TEXT NOT NULL,
                file_metadata TEXT NOT NULL,
                object_ref TEXT,
                exposure_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                uploaded_at INTEGER NOT NULL,
                completed_at INTEGER,
                failed_at INTEGER,
                processing_duration_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_batches_bank ON batches(bank_id, uploaded_at DESC);

            CREATE TABLE IF NOT EXISTS business_rules (
                rule_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL DEFAULT 1,
                expression TEXT NOT NULL,
                dimension TEXT NOT NULL,
                severity TEXT NOT NULL,
                field TEXT,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS exemptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                rule_id TEXT,
                valid_from INTEGER NOT NULL,
                valid_to INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_exemptions_entity
                ON exemptions(entity_type, entity_id);

            CREATE TABLE IF NOT EXISTS rule_violations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                batch_id TEXT NOT NULL,
                exposure_id TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                dimension TEXT NOT NULL,
                severity TEXT NOT NULL,
                field TEXT,
                message TEXT NOT NULL,
                observed_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_violations_batch ON rule_violations(batch_id);

            CREATE TABLE IF NOT EXISTS outbox_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                created_at INTEGER NOT NULL,
                published_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox_events(status, id);

            CREATE TABLE IF NOT EXISTS event_processing_failures (
                id TEXT PRIMARY KEY,
                event_type VARCHAR(500) NOT NULL,
                event_payload TEXT NOT NULL,
                error_message TEXT NOT NULL,
                error_stack TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 5,
                status TEXT NOT NULL DEFAULT 'PENDING',
                next_retry_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                processed_at INTEGER,
                failed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_failures_due
                ON event_processing_failures(status, next_retry_at, created_at);

            CREATE TABLE IF NOT EXISTS reports (
                report_id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                status TEXT NOT NULL,
                artifacts TEXT,
                created_at INTEGER NOT NULL,
                completed_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_reports_batch ON reports(batch_id);

            CREATE TABLE IF NOT EXISTS fx_rates (
                currency TEXT NOT NULL,
                rate_date TEXT NOT NULL,
                rate TEXT NOT NULL,
                PRIMARY KEY (currency, rate_date)
            );",
        )?;

        info!("database schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    pub fn insert_batch(&self, batch: &Batch) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO batches (batch_id, bank_id, status, file_metadata, object_ref,
                                  exposure_count, error_message, uploaded_at, completed_at,
                                  failed_at, processing_duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?
        .execute(params![
            batch.batch_id,
            batch.bank_id,
            batch.status.as_str(),
            serde_json::to_string(&batch.file_metadata)?,
            batch
                .object_ref
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            batch.exposure_count,
            batch.error_message,
            batch.uploaded_at.timestamp(),
            batch.completed_at.map(|t| t.timestamp()),
            batch.failed_at.map(|t| t.timestamp()),
            batch.processing_duration_ms,
        ])?;
        Ok(())
    }

    /// Inserts a new batch row and its ingestion event in one transaction.
    pub fn insert_batch_with_event(&self, batch: &Batch, event: &OutboxInsert) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> CoreResult<()> {
            conn.prepare_cached(
                "INSERT INTO batches (batch_id, bank_id, status, file_metadata, object_ref,
                                      exposure_count, error_message, uploaded_at, completed_at,
                                      failed_at, processing_duration_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?
            .execute(params![
                batch.batch_id,
                batch.bank_id,
                batch.status.as_str(),
                serde_json::to_string(&batch.file_metadata)?,
                batch
                    .object_ref
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                batch.exposure_count,
                batch.error_message,
                batch.uploaded_at.timestamp(),
                batch.completed_at.map(|t| t.timestamp()),
                batch.failed_at.map(|t| t.timestamp()),
                batch.processing_duration_ms,
            ])?;
            conn.prepare_cached(
                "INSERT INTO outbox_events (event_type, payload, status, created_at)
                 VALUES (?1, ?2, 'PENDING', ?3)",
            )?
            .execute(params![event.event_type, event.payload, Utc::now().timestamp()])?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    pub fn get_batch(&self, batch_id: &str) -> CoreResult<Option<Batch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT batch_id, bank_id, status, file_metadata, object_ref, exposure_count,
                    error_message, uploaded_at, completed_at, failed_at, processing_duration_ms
             FROM batches WHERE batch_id = ?1",
        )?;
        let mut rows = stmt.query(params![batch_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(batch_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_batches(&self, bank_id: &str, limit: usize) -> CoreResult<Vec<Batch>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT batch_id, bank_id, status, file_metadata, object_ref, exposure_count,
                    error_message, uploaded_at, completed_at, failed_at, processing_duration_ms
             FROM batches WHERE bank_id = ?1 ORDER BY uploaded_at DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![bank_id, limit as i64])?;
        let mut batches = Vec::new();
        while let Some(row) = rows.next()? {
            batches.push(batch_from_row(row)?);
        }
        Ok(batches)
    }

    /// Persists a transition that does not carry violations or events.
    pub fn update_batch(&self, batch: &Batch) -> CoreResult<()> {
        let conn = self.conn.lock();
        update_batch_row(&conn, batch)?;
        Ok(())
    }

    /// Commits the batch row, its violations and the staged outbox events in
    /// one transaction, so event emission is totally ordered after the batch
    /// state it describes.
    pub fn commit_batch_results(
        &self,
        batch: &Batch,
        violations: &[RuleViolation],
        outbox: &[OutboxInsert],
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> CoreResult<()> {
            update_batch_row(&conn, batch)?;
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO rule_violations (batch_id, exposure_id, rule_id, dimension,
                                                  severity, field, message, observed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for violation in violations {
                    stmt.execute(params![
                        violation.batch_id,
                        violation.exposure_id,
                        violation.rule_id,
                        violation.dimension.as_str(),
                        violation.severity.as_str(),
                        violation.field,
                        violation.message,
                        violation.observed_at.timestamp(),
                    ])?;
                }
            }
            {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO outbox_events (event_type, payload, status, created_at)
                     VALUES (?1, ?2, 'PENDING', ?3)",
                )?;
                let now = Utc::now().timestamp();
                for event in outbox {
                    stmt.execute(params![event.event_type, event.payload, now])?;
                }
            }
            Ok(())
        })();
        match result {
            Ok(()) => {
                conn.execute("COMMIT", [])?;
                debug!(
                    batch_id = %batch.batch_id,
                    violations = violations.len(),
                    events = outbox.len(),
                    "batch results committed"
                );
                Ok(())
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }

    pub fn violations_for_batch(&self, batch_id: &str) -> CoreResult<Vec<RuleViolation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT batch_id, exposure_id, rule_id, dimension, severity, field, message,
                    observed_at
             FROM rule_violations WHERE batch_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![batch_id])?;
        let mut violations = Vec::new();
        while let Some(row) = rows.next()? {
            violations.push(RuleViolation {
                batch_id: row.get(0)?,
                exposure_id: row.get(1)?,
                rule_id: row.get(2)?,
                dimension: QualityDimension::parse(&row.get::<_, String>(3)?)
                    .ok_or_else(|| CoreError::system("bad dimension in rule_violations"))?,
                severity: RuleSeverity::parse(&row.get::<_, String>(4)?)
                    .ok_or_else(|| CoreError::system("bad severity in rule_violations"))?,
                field: row.get(5)?,
                message: row.get(6)?,
                observed_at: from_ts(row.get(7)?),
            });
        }
        Ok(violations)
    }

    // -----------------------------------------------------------------------
    // Rules & exemptions
    // -----------------------------------------------------------------------

    pub fn insert_rule(&self, rule: &BusinessRule) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO business_rules (rule_id, enabled, expression, dimension, severity,
                                         field, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?
        .execute(params![
            rule.rule_id,
            rule.enabled as i64,
            rule.expression,
            rule.dimension.as_str(),
            rule.severity.as_str(),
            rule.field,
            rule.message,
            Utc::now().timestamp(),
        ])?;
        Ok(())
    }

    pub fn insert_exemption(&self, exemption: &Exemption) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO exemptions (entity_type, entity_id, rule_id, valid_from, valid_to)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?
        .execute(params![
            exemption.entity_type,
            exemption.entity_id,
            exemption.rule_id,
            exemption.valid_from.timestamp(),
            exemption.valid_to.timestamp(),
        ])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbox
    // -----------------------------------------------------------------------

    pub fn enqueue_event(&self, event: &OutboxInsert) -> CoreResult<i64> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO outbox_events (event_type, payload, status, created_at)
             VALUES (?1, ?2, 'PENDING', ?3)",
        )?
        .execute(params![event.event_type, event.payload, Utc::now().timestamp()])?;
        Ok(conn.last_insert_rowid())
    }

    pub fn pending_outbox(&self, limit: usize) -> CoreResult<Vec<OutboxRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, payload, created_at FROM outbox_events
             WHERE status = 'PENDING' ORDER BY id LIMIT ?1",
        )?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut pending = Vec::new();
        while let Some(row) = rows.next()? {
            pending.push(OutboxRow {
                id: row.get(0)?,
                event_type: row.get(1)?,
                payload: row.get(2)?,
                created_at: from_ts(row.get(3)?),
            });
        }
        Ok(pending)
    }

    pub fn mark_outbox_published(&self, id: i64) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE outbox_events SET status = 'PUBLISHED', published_at = ?1 WHERE id = ?2",
        )?
        .execute(params![Utc::now().timestamp(), id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure queue
    // -----------------------------------------------------------------------

    pub fn insert_failure(&self, row: &EventFailureRow) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO event_processing_failures
                 (id, event_type, event_payload, error_message, error_stack, retry_count,
                  max_retries, status, next_retry_at, created_at, processed_at, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?
        .execute(params![
            row.id,
            row.event_type,
            row.event_payload,
            row.error_message,
            row.error_stack,
            row.retry_count,
            row.max_retries,
            row.status.as_str(),
            row.next_retry_at.timestamp(),
            row.created_at.timestamp(),
            row.processed_at.map(|t| t.timestamp()),
            row.failed_at.map(|t| t.timestamp()),
        ])?;
        Ok(())
    }

    /// Due PENDING rows, oldest first.
    pub fn due_failures(&self, now: DateTime<Utc>, limit: usize) -> CoreResult<Vec<EventFailureRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, event_payload, error_message, error_stack, retry_count,
                    max_retries, status, next_retry_at, created_at, processed_at, failed_at
             FROM event_processing_failures
             WHERE status = 'PENDING' AND next_retry_at <= ?1
             ORDER BY created_at LIMIT ?2",
        )?;
        let mut rows = stmt.query(params![now.timestamp(), limit as i64])?;
        let mut due = Vec::new();
        while let Some(row) = rows.next()? {
            due.push(failure_from_row(row)?);
        }
        Ok(due)
    }

    pub fn get_failure(&self, id: &str) -> CoreResult<Option<EventFailureRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, event_type, event_payload, error_message, error_stack, retry_count,
                    max_retries, status, next_retry_at, created_at, processed_at, failed_at
             FROM event_processing_failures WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(failure_from_row(row)?)),
            None => Ok(None),
        }
    }

    /// Claims a PENDING row for processing. Returns false when another
    /// worker already claimed it.
    pub fn claim_failure(&self, id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let updated = conn
            .prepare_cached(
                "UPDATE event_processing_failures SET status = 'PROCESSING'
                 WHERE id = ?1 AND status = 'PENDING'",
            )?
            .execute(params![id])?;
        Ok(updated == 1)
    }

    pub fn mark_failure_succeeded(&self, id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE event_processing_failures
             SET status = 'SUCCEEDED', processed_at = ?1 WHERE id = ?2",
        )?
        .execute(params![Utc::now().timestamp(), id])?;
        Ok(())
    }

    pub fn reschedule_failure(
        &self,
        id: &str,
        retry_count: u32,
        error_message: &str,
        next_retry_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE event_processing_failures
             SET status = 'PENDING', retry_count = ?1, error_message = ?2, next_retry_at = ?3
             WHERE id = ?4",
        )?
        .execute(params![retry_count, error_message, next_retry_at.timestamp(), id])?;
        Ok(())
    }

    pub fn mark_failure_dead(&self, id: &str, error_message: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE event_processing_failures
             SET status = 'DEAD_LETTER', error_message = ?1, failed_at = ?2 WHERE id = ?3",
        )?
        .execute(params![error_message, Utc::now().timestamp(), id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reports
    // -----------------------------------------------------------------------

    pub fn insert_report_pending(&self, report_id: &str, batch_id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO reports (report_id, batch_id, status, created_at)
             VALUES (?1, ?2, 'PENDING', ?3)",
        )?
        .execute(params![report_id, batch_id, Utc::now().timestamp()])?;
        Ok(())
    }

    pub fn mark_report_completed(&self, report_id: &str, artifacts_json: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "UPDATE reports SET status = 'COMPLETED', artifacts = ?1, completed_at = ?2
             WHERE report_id = ?3",
        )?
        .execute(params![artifacts_json, Utc::now().timestamp(), report_id])?;
        Ok(())
    }

    pub fn mark_report_failed(&self, report_id: &str) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached("UPDATE reports SET status = 'FAILED' WHERE report_id = ?1")?
            .execute(params![report_id])?;
        Ok(())
    }

    pub fn completed_report_exists(&self, batch_id: &str) -> CoreResult<bool> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT COUNT(*) FROM reports WHERE batch_id = ?1 AND status = 'COMPLETED'",
        )?;
        let count: i64 = stmt.query_row(params![batch_id], |row| row.get(0))?;
        Ok(count > 0)
    }

    pub fn report_for_batch(&self, batch_id: &str) -> CoreResult<Option<ReportRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT report_id, batch_id, status, artifacts, created_at, completed_at
             FROM reports WHERE batch_id = ?1 ORDER BY created_at DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![batch_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(ReportRow {
                report_id: row.get(0)?,
                batch_id: row.get(1)?,
                status: row.get(2)?,
                artifacts_json: row.get(3)?,
                created_at: from_ts(row.get(4)?),
                completed_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
            })),
            None => Ok(None),
        }
    }

    // -----------------------------------------------------------------------
    // FX rates
    // -----------------------------------------------------------------------

    pub fn upsert_fx_rate(&self, currency: &str, date: NaiveDate, rate: Decimal) -> CoreResult<()> {
        let conn = self.conn.lock();
        conn.prepare_cached(
            "INSERT INTO fx_rates (currency, rate_date, rate) VALUES (?1, ?2, ?3)
             ON CONFLICT (currency, rate_date) DO UPDATE SET rate = excluded.rate",
        )?
        .execute(params![
            currency.to_ascii_uppercase(),
            date.to_string(),
            rate.to_string()
        ])?;
        Ok(())
    }

    /// Exact date first, then the most recent prior quote within 7 days.
    pub fn fx_rate(&self, currency: &str, date: NaiveDate) -> CoreResult<Option<Decimal>> {
        let currency = currency.to_ascii_uppercase();
        if currency == "EUR" {
            return Ok(Some(Decimal::ONE));
        }
        let floor = date - chrono::Duration::days(7);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT rate FROM fx_rates
             WHERE currency = ?1 AND rate_date <= ?2 AND rate_date >= ?3
             ORDER BY rate_date DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![currency, date.to_string(), floor.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                Ok(Some(Decimal::from_str(&raw).map_err(|e| {
                    CoreError::system(format!("bad rate for {currency}: {e}"))
                })?))
            }
            None => Ok(None),
        }
    }
}

impl crate::rules::engine::ViolationSink for Database {
    fn persist_violations(
        &self,
        batch_id: &str,
        violations: &[RuleViolation],
    ) -> CoreResult<usize> {
        let conn = self.conn.lock();
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> CoreResult<usize> {
            let mut stmt = conn.prepare_cached(
                "INSERT INTO rule_violations (batch_id, exposure_id, rule_id, dimension,
                                              severity, field, message, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for violation in violations {
                stmt.execute(params![
                    batch_id,
                    violation.exposure_id,
                    violation.rule_id,
                    violation.dimension.as_str(),
                    violation.severity.as_str(),
                    violation.field,
                    violation.message,
                    violation.observed_at.timestamp(),
                ])?;
            }
            Ok(violations.len())
        })();
        match result {
            Ok(count) => {
                conn.execute("COMMIT", [])?;
                Ok(count)
            }
            Err(e) => {
                conn.execute("ROLLBACK", []).ok();
                Err(e)
            }
        }
    }
}

impl RuleSource for Database {
    fn load_enabled_rules(&self) -> CoreResult<Vec<BusinessRule>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT rule_id, enabled, expression, dimension, severity, field, message
             FROM business_rules WHERE enabled = 1 ORDER BY rule_id",
        )?;
        let mut rows = stmt.query([])?;
        let mut rules = Vec::new();
        while let Some(row) = rows.next()? {
            rules.push(BusinessRule {
                rule_id: row.get(0)?,
                enabled: row.get::<_, i64>(1)? != 0,
                expression: row.get(2)?,
                dimension: QualityDimension::parse(&row.get::<_, String>(3)?)
                    .ok_or_else(|| CoreError::system("bad dimension in business_rules"))?,
                severity: RuleSeverity::parse(&row.get::<_, String>(4)?)
                    .ok_or_else(|| CoreError::system("bad severity in business_rules"))?,
                field: row.get(5)?,
                message: row.get(6)?,
            });
        }
        Ok(rules)
    }

    fn load_exemptions(
        &self,
        entity_type: &str,
        entity_ids: &[String],
    ) -> CoreResult<Vec<Exemption>> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let placeholders = vec!["?"; entity_ids.len()].join(",");
        let sql = format!(
            "SELECT entity_type, entity_id, rule_id, valid_from, valid_to
             FROM exemptions WHERE entity_type = ? AND entity_id IN ({placeholders})"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<&str> = Vec::with_capacity(entity_ids.len() + 1);
        bound.push(entity_type);
        for id in entity_ids {
            bound.push(id.as_str());
        }
        let mut rows = stmt.query(params_from_iter(bound))?;
        let mut exemptions = Vec::new();
        while let Some(row) = rows.next()? {
            exemptions.push(Exemption {
                entity_type: row.get(0)?,
                entity_id: row.get(1)?,
                rule_id: row.get(2)?,
                valid_from: from_ts(row.get(3)?),
                valid_to: from_ts(row.get(4)?),
            });
        }
        Ok(exemptions)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn update_batch_row(conn: &Connection, batch: &Batch) -> CoreResult<()> {
    conn.prepare_cached(
        "UPDATE batches
         SET status = ?1, object_ref = ?2, exposure_count = ?3, error_message = ?4,
             completed_at = ?5, failed_at = ?6, processing_duration_ms = ?7
         WHERE batch_id = ?8",
    )?
    .execute(params![
        batch.status.as_str(),
        batch
            .object_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?,
        batch.exposure_count,
        batch.error_message,
        batch.completed_at.map(|t| t.timestamp()),
        batch.failed_at.map(|t| t.timestamp()),
        batch.processing_duration_ms,
        batch.batch_id,
    ])?;
    Ok(())
}

fn batch_from_row(row: &rusqlite::Row<'_>) -> CoreResult<Batch> {
    let status_raw: String = row.get(2)?;
    let file_metadata_raw: String = row.get(3)?;
    let object_ref_raw: Option<String> = row.get(4)?;
    let file_metadata: FileMetadata = serde_json::from_str(&file_metadata_raw)?;
    let object_ref: Option<ObjectRef> = object_ref_raw
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    Ok(Batch {
        batch_id: row.get(0)?,
        bank_id: row.get(1)?,
        status: BatchStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::system(format!("bad batch status '{status_raw}'")))?,
        file_metadata,
        object_ref,
        exposure_count: row.get(5)?,
        error_message: row.get(6)?,
        uploaded_at: from_ts(row.get(7)?),
        completed_at: row.get::<_, Option<i64>>(8)?.map(from_ts),
        failed_at: row.get::<_, Option<i64>>(9)?.map(from_ts),
        processing_duration_ms: row.get(10)?,
    })
}

fn failure_from_row(row: &rusqlite::Row<'_>) -> CoreResult<EventFailureRow> {
    let status_raw: String = row.get(7)?;
    Ok(EventFailureRow {
        id: row.get(0)?,
        event_type: row.get(1)?,
        event_payload: row.get(2)?,
        error_message: row.get(3)?,
        error_stack: row.get(4)?,
        retry_count: row.get(5)?,
        max_retries: row.get(6)?,
        status: FailureStatus::parse(&status_raw)
            .ok_or_else(|| CoreError::system(format!("bad failure status '{status_raw}'")))?,
        next_retry_at: from_ts(row.get(8)?),
        created_at: from_ts(row.get(9)?),
        processed_at: row.get::<_, Option<i64>>(10)?.map(from_ts),
        failed_at: row.get::<_, Option<i64>>(11)?.map(from_ts),
    })
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::new_batch_id;
    use rust_decimal_macros::dec;

    fn sample_batch() -> Batch {
        Batch {
            batch_id: new_batch_id(Utc::now()),
            bank_id: "08081".to_string(),
            status: BatchStatus::Uploaded,
            file_metadata: FileMetadata {
                file_name: "exposures.json".to_string(),
                content_type: "application/json".to_string(),
                size_bytes: 128,
                md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
                sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                    .to_string(),
            },
            object_ref: None,
            exposure_count: 0,
            uploaded_at: Utc::now(),
            completed_at: None,
            failed_at: None,
            error_message: None,
            processing_duration_ms: None,
        }
    }

    #[test]
    fn test_batch_round_trip() {
        let db = Database::in_memory().unwrap();
        let mut batch = sample_batch();
        db.insert_batch(&batch).unwrap();

        let loaded = db.get_batch(&batch.batch_id).unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Uploaded);
        assert_eq!(loaded.bank_id, "08081");
        assert_eq!(loaded.file_metadata.file_name, "exposures.json");

        batch.status = BatchStatus::Parsing;
        batch.object_ref = Some(ObjectRef {
            bucket: "b".to_string(),
            key: "raw/x/f.json".to_string(),
            version_id: "v1".to_string(),
        });
        db.update_batch(&batch).unwrap();
        let loaded = db.get_batch(&batch.batch_id).unwrap().unwrap();
        assert_eq!(loaded.status, BatchStatus::Parsing);
        assert!(loaded.object_ref.is_some());
    }

    #[test]
    fn test_commit_batch_results_is_atomic_and_ordered() {
        let db = Database::in_memory().unwrap();
        let mut batch = sample_batch();
        db.insert_batch(&batch).unwrap();
        batch.status = BatchStatus::Completed;

        let violation = RuleViolation {
            batch_id: batch.batch_id.clone(),
            exposure_id: "E1".to_string(),
            rule_id: "R1".to_string(),
            dimension: QualityDimension::Accuracy,
            severity: RuleSeverity::High,
            field: None,
            message: "bad".to_string(),
            observed_at: Utc::now(),
        };
        let event = OutboxInsert {
            event_type: "BatchQualityCompleted".to_string(),
            payload: "{}".to_string(),
        };
        db.commit_batch_results(&batch, &[violation], &[event]).unwrap();

        assert_eq!(db.violations_for_batch(&batch.batch_id).unwrap().len(), 1);
        let pending = db.pending_outbox(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "BatchQualityCompleted");

        db.mark_outbox_published(pending[0].id).unwrap();
        assert!(db.pending_outbox(10).unwrap().is_empty());
    }

    #[test]
    fn test_rules_and_exemptions_load() {
        let db = Database::in_memory().unwrap();
        db.insert_rule(&BusinessRule {
            rule_id: "R1".to_string(),
            enabled: true,
            expression: "exposure_amount > 0".to_string(),
            dimension: QualityDimension::Validity,
            severity: RuleSeverity::Critical,
            field: Some("exposure_amount".to_string()),
            message: "amount must be positive".to_string(),
        })
        .unwrap();
        db.insert_rule(&BusinessRule {
            rule_id: "R2".to_string(),
            enabled: false,
            expression: "TRUE".to_string(),
            dimension: QualityDimension::Validity,
            severity: RuleSeverity::Low,
            field: None,
            message: "disabled".to_string(),
        })
        .unwrap();

        let rules = db.load_enabled_rules().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].rule_id, "R1");

        let now = Utc::now();
        db.insert_exemption(&Exemption {
            entity_type: "EXPOSURE".to_string(),
            entity_id: "E1".to_string(),
            rule_id: Some("R1".to_string()),
            valid_from: now - chrono::Duration::days(1),
            valid_to: now + chrono::Duration::days(1),
        })
        .unwrap();

        let exemptions = db
            .load_exemptions("EXPOSURE", &["E1".to_string(), "E2".to_string()])
            .unwrap();
        assert_eq!(exemptions.len(), 1);
        assert!(exemptions[0].covers("R1", now));
        assert!(db.load_exemptions("EXPOSURE", &[]).unwrap().is_empty());
    }

    #[test]
    fn test_failure_queue_lifecycle() {
        let db = Database::in_memory().unwrap();
        let now = Utc::now();
        let row = EventFailureRow {
            id: "f1".to_string(),
            event_type: "ReportGenerationRequested".to_string(),
            event_payload: "{}".to_string(),
            error_message: "boom".to_string(),
            error_stack: Some("stack".to_string()),
            retry_count: 0,
            max_retries: 2,
            status: FailureStatus::Pending,
            next_retry_at: now,
            created_at: now,
            processed_at: None,
            failed_at: None,
        };
        db.insert_failure(&row).unwrap();

        let due = db.due_failures(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert!(db.claim_failure("f1").unwrap());
        // A second claim loses the race.
        assert!(!db.claim_failure("f1").unwrap());

        db.reschedule_failure("f1", 1, "boom again", now + chrono::Duration::seconds(10))
            .unwrap();
        assert!(db.due_failures(now, 10).unwrap().is_empty());
        let later = now + chrono::Duration::seconds(11);
        assert_eq!(db.due_failures(later, 10).unwrap().len(), 1);

        db.mark_failure_dead("f1", "exhausted").unwrap();
        let dead = db.get_failure("f1").unwrap().unwrap();
        assert_eq!(dead.status, FailureStatus::DeadLetter);
        assert!(dead.failed_at.is_some());
    }

    #[test]
    fn test_batch_persist_validation_results_single_flush() {
        use crate::rules::{batch_persist_validation_results, EvalStats, ExposureValidation};
        let db = Database::in_memory().unwrap();
        let results = vec![
            ExposureValidation {
                exposure_id: "E1".to_string(),
                errors: vec![],
                violations: vec![RuleViolation {
                    batch_id: "b1".to_string(),
                    exposure_id: "E1".to_string(),
                    rule_id: "R1".to_string(),
                    dimension: QualityDimension::Completeness,
                    severity: RuleSeverity::Low,
                    field: None,
                    message: "m".to_string(),
                    observed_at: Utc::now(),
                }],
                stats: EvalStats::default(),
            },
            ExposureValidation {
                exposure_id: "E2".to_string(),
                errors: vec![],
                violations: vec![],
                stats: EvalStats::default(),
            },
        ];
        let inserted = batch_persist_validation_results(&db, "b1", &results).unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.violations_for_batch("b1").unwrap().len(), 1);
    }

    #[test]
    fn test_report_idempotency_flag() {
        let db = Database::in_memory().unwrap();
        assert!(!db.completed_report_exists("b1").unwrap());
        db.insert_report_pending("r1", "b1").unwrap();
        assert!(!db.completed_report_exists("b1").unwrap());
        db.mark_report_completed("r1", "[]").unwrap();
        assert!(db.completed_report_exists("b1").unwrap());
        let report = db.report_for_batch("b1").unwrap().unwrap();
        assert_eq!(report.status, "COMPLETED");
    }

    #[test]
    fn test_fx_rate_lookback() {
        let db = Database::in_memory().unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 6, 30).unwrap();
        db.upsert_fx_rate("USD", date - chrono::Duration::days(2), dec!(0.91))
            .unwrap();

        // Exact date missing: falls back to the most recent prior quote.
        assert_eq!(db.fx_rate("USD", date).unwrap(), Some(dec!(0.91)));
        db.upsert_fx_rate("USD", date, dec!(0.92)).unwrap();
        assert_eq!(db.fx_rate("USD", date).unwrap(), Some(dec!(0.92)));

        // Quotes older than 7 days are out of the window.
        assert_eq!(
            db.fx_rate("USD", date + chrono::Duration::days(30)).unwrap(),
            None
        );
        // EUR short-circuits.
        assert_eq!(db.fx_rate("EUR", date).unwrap(), Some(Decimal::ONE));
    }
}
