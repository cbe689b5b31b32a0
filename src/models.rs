//! Core domain model for the exposure-processing pipeline.
//!
//! Everything that crosses a subsystem seam lives here: batch lifecycle
//! records, parsed exposures, quality rules and violations, classified
//! exposures, portfolio analysis, and runtime configuration. Monetary
//! amounts are `rust_decimal::Decimal` throughout; binary floats never
//! touch an amount.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Batch lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    Uploaded,
    Parsing,
    Validated,
    Storing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Uploaded => "UPLOADED",
            BatchStatus::Parsing => "PARSING",
            BatchStatus::Validated => "VALIDATED",
            BatchStatus::Storing => "STORING",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADED" => Some(BatchStatus::Uploaded),
            "PARSING" => Some(BatchStatus::Parsing),
            "VALIDATED" => Some(BatchStatus::Validated),
            "STORING" => Some(BatchStatus::Storing),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub md5: String,
    pub sha256: String,
}

/// Location of an artifact in the object store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub bucket: String,
    pub key: String,
    pub version_id: String,
}

impl ObjectRef {
    pub fn uri(&self) -> String {
        format!("regflow://{}/{}?v={}", self.bucket, self.key, self.version_id)
    }

    /// Parses a URI produced by [`ObjectRef::uri`].
    pub fn from_uri(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("regflow://")?;
        let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
        let (bucket, key) = path.split_once('/')?;
        if bucket.is_empty() || key.is_empty() {
            return None;
        }
        let version_id = query
            .split('&')
            .find_map(|pair| pair.strip_prefix("v="))
            .unwrap_or("")
            .to_string();
        Some(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
            version_id,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    pub bank_id: String,
    pub status: BatchStatus,
    pub file_metadata: FileMetadata,
    pub object_ref: Option<ObjectRef>,
    pub exposure_count: i64,
    pub uploaded_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub processing_duration_ms: Option<i64>,
}

/// Batch ids sort by creation time: millis prefix + uuid suffix.
pub fn new_batch_id(now: DateTime<Utc>) -> String {
    format!(
        "b{:013}-{}",
        now.timestamp_millis(),
        &uuid::Uuid::new_v4().simple().to_string()[..12]
    )
}

// ---------------------------------------------------------------------------
// Exposure records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureRecord {
    pub exposure_id: String,
    pub reference_number: Option<String>,
    pub counterparty_id: Option<String>,
    pub counterparty_lei: Option<String>,
    pub counterparty_type: Option<String>,
    pub sector: Option<String>,
    /// ISO 3166-1 alpha-2.
    pub country_code: Option<String>,
    pub exposure_amount: Decimal,
    /// ISO 4217.
    pub currency: String,
    pub product_type: Option<String>,
    pub internal_rating: Option<String>,
    pub risk_category: Option<String>,
    pub risk_weight: Option<Decimal>,
    pub reporting_date: Option<NaiveDate>,
    pub valuation_date: Option<NaiveDate>,
    pub maturity_date: Option<NaiveDate>,
}

impl ExposureRecord {
    pub fn is_corporate_exposure(&self) -> bool {
        self.counterparty_type
            .as_deref()
            .map(|t| {
                let t = t.to_ascii_uppercase();
                t.contains("CORPORATE") || t == "SME"
            })
            .unwrap_or(false)
    }

    pub fn is_term_exposure(&self) -> bool {
        self.maturity_date.is_some()
    }
}

/// Sidecar bank header parsed from the inbound file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BankInfo {
    pub bank_name: Option<String>,
    pub bank_code: Option<String>,
    pub lei: Option<String>,
    pub reporting_date: Option<NaiveDate>,
    pub expected_exposure_count: Option<i64>,
}

/// One credit-risk-mitigation entry from the sidecar stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrmEntry {
    pub exposure_id: String,
    pub protection_amount: Decimal,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Rules, violations, exemptions
// ---------------------------------------------------------------------------

/// The six BCBS 239 quality axes. Declaration order is the tie-break order
/// for lowest/highest scoring dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityDimension {
    Completeness,
    Accuracy,
    Consistency,
    Timeliness,
    Uniqueness,
    Validity,
}

impl QualityDimension {
    pub const ALL: [QualityDimension; 6] = [
        QualityDimension::Completeness,
        QualityDimension::Accuracy,
        QualityDimension::Consistency,
        QualityDimension::Timeliness,
        QualityDimension::Uniqueness,
        QualityDimension::Validity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityDimension::Completeness => "COMPLETENESS",
            QualityDimension::Accuracy => "ACCURACY",
            QualityDimension::Consistency => "CONSISTENCY",
            QualityDimension::Timeliness => "TIMELINESS",
            QualityDimension::Uniqueness => "UNIQUENESS",
            QualityDimension::Validity => "VALIDITY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RuleSeverity {
    Critical,
    High,
    Medium,
    Low,
}

impl RuleSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleSeverity::Critical => "CRITICAL",
            RuleSeverity::High => "HIGH",
            RuleSeverity::Medium => "MEDIUM",
            RuleSeverity::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CRITICAL" => Some(RuleSeverity::Critical),
            "HIGH" => Some(RuleSeverity::High),
            "MEDIUM" => Some(RuleSeverity::Medium),
            "LOW" => Some(RuleSeverity::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessRule {
    pub rule_id: String,
    pub enabled: bool,
    /// Predicate in the expression grammar; `true` means the check passed.
    pub expression: String,
    pub dimension: QualityDimension,
    pub severity: RuleSeverity,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleViolation {
    pub batch_id: String,
    pub exposure_id: String,
    pub rule_id: String,
    pub dimension: QualityDimension,
    pub severity: RuleSeverity,
    pub field: Option<String>,
    pub message: String,
    pub observed_at: DateTime<Utc>,
}

/// Time-windowed waiver excluding a rule (or all rules when `rule_id` is
/// None) from applying to one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exemption {
    pub entity_type: String,
    pub entity_id: String,
    pub rule_id: Option<String>,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl Exemption {
    pub fn covers(&self, rule_id: &str, at: DateTime<Utc>) -> bool {
        let rule_match = self.rule_id.as_deref().map(|r| r == rule_id).unwrap_or(true);
        rule_match && self.valid_from <= at && at <= self.valid_to
    }
}

// ---------------------------------------------------------------------------
// Quality scores
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityGrade {
    #[serde(rename = "A+")]
    APlus,
    A,
    B,
    C,
    F,
}

impl QualityGrade {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityGrade::APlus => "A+",
            QualityGrade::A => "A",
            QualityGrade::B => "B",
            QualityGrade::C => "C",
            QualityGrade::F => "F",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityScores {
    /// Score per dimension, keyed by `QualityDimension::as_str`.
    pub dimension_scores: BTreeMap<String, Decimal>,
    pub overall_score: Decimal,
    pub grade: QualityGrade,
}

// ---------------------------------------------------------------------------
// Classification & portfolio analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeographicRegion {
    Italy,
    EuOther,
    NonEuropean,
}

impl GeographicRegion {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeographicRegion::Italy => "ITALY",
            GeographicRegion::EuOther => "EU_OTHER",
            GeographicRegion::NonEuropean => "NON_EUROPEAN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EconomicSector {
    RetailMortgage,
    Corporate,
    Sovereign,
    Banking,
    Other,
}

impl EconomicSector {
    pub fn as_str(&self) -> &'static str {
        match self {
            EconomicSector::RetailMortgage => "RETAIL_MORTGAGE",
            EconomicSector::Corporate => "CORPORATE",
            EconomicSector::Sovereign => "SOVEREIGN",
            EconomicSector::Banking => "BANKING",
            EconomicSector::Other => "OTHER",
        }
    }
}

/// An exposure after EUR conversion and classification. Ephemeral: streamed
/// through the calculation stage, never persisted per record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedExposure {
    pub record: ExposureRecord,
    pub eur_amount: Decimal,
    pub mitigated_amount_eur: Decimal,
    pub geographic_region: GeographicRegion,
    pub economic_sector: EconomicSector,
    pub exchange_rate_used: Decimal,
    pub rate_date: NaiveDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownSlice {
    pub amount_eur: Decimal,
    pub percentage: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortfolioTrend {
    Stable,
    Concentrating,
    Diversifying,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioAnalysis {
    pub batch_id: String,
    pub total_portfolio: Decimal,
    pub geographic_breakdown: BTreeMap<String, BreakdownSlice>,
    pub sector_breakdown: BTreeMap<String, BreakdownSlice>,
    pub geographic_hhi: Decimal,
    pub sector_hhi: Decimal,
    pub trend: PortfolioTrend,
    pub analyzed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Report formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportFormat {
    Pdf,
    Spreadsheet,
    Xbrl,
}

impl ReportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Spreadsheet => "spreadsheet",
            ReportFormat::Xbrl => "xbrl",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Pdf => "pdf",
            ReportFormat::Spreadsheet => "csv",
            ReportFormat::Xbrl => "xbrl.xml",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pdf" => Some(ReportFormat::Pdf),
            "spreadsheet" | "csv" | "xlsx" => Some(ReportFormat::Spreadsheet),
            "xbrl" | "xml" => Some(ReportFormat::Xbrl),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Local,
    ObjectStore,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub storage_type: StorageType,
    pub storage_root: String,
    pub storage_bucket: String,
    pub storage_prefix: String,
    pub presign_secret: String,
    pub retry_max_retries: u32,
    pub retry_backoff_schedule: Vec<Duration>,
    pub rules_cache_across_batches: bool,
    pub coordinator_stale_event_hours: i64,
    pub batch_timeout: Duration,
    /// Weights over `QualityDimension::ALL`, summing to 1.
    pub quality_weights: [Decimal; 6],
    pub report_formats: Vec<ReportFormat>,
    pub pipeline_workers: usize,
    pub failure_poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./regflow.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let storage_type = match std::env::var("STORAGE_TYPE")
            .unwrap_or_else(|_| "local".to_string())
            .as_str()
        {
            "object-store" => StorageType::ObjectStore,
            _ => StorageType::Local,
        };

        let storage_root =
            std::env::var("STORAGE_ROOT").unwrap_or_else(|_| "./regflow-objects".to_string());
        let storage_bucket =
            std::env::var("STORAGE_BUCKET").unwrap_or_else(|_| "regflow".to_string());
        let storage_prefix = std::env::var("STORAGE_PREFIX").unwrap_or_default();
        let presign_secret = std::env::var("PRESIGN_SECRET")
            .unwrap_or_else(|_| "regflow-dev-presign-secret".to_string());

        let retry_max_retries = std::env::var("RETRY_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let retry_backoff_schedule = parse_backoff_schedule(
            &std::env::var("RETRY_BACKOFF_SCHEDULE")
                .unwrap_or_else(|_| "10s,30s,60s,5m,10m".to_string()),
        );

        let rules_cache_across_batches = std::env::var("RULES_CACHE_ACROSS_BATCHES")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let coordinator_stale_event_hours = std::env::var("COORDINATOR_STALE_EVENT_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&h: &i64| h > 0)
            .unwrap_or(24);

        let batch_timeout = Duration::from_secs(
            std::env::var("BATCH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&s: &u64| s > 0)
                .unwrap_or(1800),
        );

        let quality_weights = std::env::var("QUALITY_WEIGHTS")
            .ok()
            .and_then(|v| parse_quality_weights(&v))
            .unwrap_or_else(uniform_quality_weights);

        let report_formats: Vec<ReportFormat> = std::env::var("REPORT_FORMATS")
            .unwrap_or_else(|_| "spreadsheet".to_string())
            .split(',')
            .filter_map(ReportFormat::parse)
            .collect();
        let report_formats = if report_formats.is_empty() {
            vec![ReportFormat::Spreadsheet]
        } else {
            report_formats
        };

        let pipeline_workers = std::env::var("PIPELINE_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&w: &usize| w > 0)
            .unwrap_or(2);

        let failure_poll_interval = Duration::from_secs(
            std::env::var("FAILURE_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&s: &u64| s > 0)
                .unwrap_or(5),
        );

        Ok(Self {
            database_path,
            port,
            storage_type,
            storage_root,
            storage_bucket,
            storage_prefix,
            presign_secret,
            retry_max_retries,
            retry_backoff_schedule,
            rules_cache_across_batches,
            coordinator_stale_event_hours,
            batch_timeout,
            quality_weights,
            report_formats,
            pipeline_workers,
            failure_poll_interval,
        })
    }

    /// Test/default configuration rooted in the given scratch directory.
    pub fn for_test(root: &std::path::Path) -> Self {
        Self {
            database_path: root.join("regflow.db").to_string_lossy().into_owned(),
            port: 0,
            storage_type: StorageType::Local,
            storage_root: root.join("objects").to_string_lossy().into_owned(),
            storage_bucket: "regflow-test".to_string(),
            storage_prefix: String::new(),
            presign_secret: "test-secret".to_string(),
            retry_max_retries: 5,
            retry_backoff_schedule: parse_backoff_schedule("10s,30s,60s,5m,10m"),
            rules_cache_across_batches: true,
            coordinator_stale_event_hours: 24,
            batch_timeout: Duration::from_secs(1800),
            quality_weights: uniform_quality_weights(),
            report_formats: vec![ReportFormat::Spreadsheet],
            pipeline_workers: 2,
            failure_poll_interval: Duration::from_millis(50),
        }
    }
}

pub fn uniform_quality_weights() -> [Decimal; 6] {
    let w = Decimal::ONE / Decimal::from(6);
    [w; 6]
}

/// Parses "10s,30s,60s,5m,10m" into durations. Unknown entries are skipped.
pub fn parse_backoff_schedule(raw: &str) -> Vec<Duration> {
    let parsed: Vec<Duration> = raw
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            let (digits, unit) = entry.split_at(entry.len().saturating_sub(1));
            let n: u64 = digits.parse().ok()?;
            match unit {
                "s" => Some(Duration::from_secs(n)),
                "m" => Some(Duration::from_secs(n * 60)),
                "h" => Some(Duration::from_secs(n * 3600)),
                _ => None,
            }
        })
        .collect();
    if parsed.is_empty() {
        vec![
            Duration::from_secs(10),
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(300),
            Duration::from_secs(600),
        ]
    } else {
        parsed
    }
}

fn parse_quality_weights(raw: &str) -> Option<[Decimal; 6]> {
    use std::str::FromStr;
    let parts: Vec<Decimal> = raw
        .split(',')
        .map(|p| Decimal::from_str(p.trim()))
        .collect::<Result<_, _>>()
        .ok()?;
    if parts.len() != 6 {
        return None;
    }
    let sum: Decimal = parts.iter().copied().sum();
    let tolerance = Decimal::new(1, 9);
    if (sum - Decimal::ONE).abs() > tolerance {
        return None;
    }
    Some([parts[0], parts[1], parts[2], parts[3], parts[4], parts[5]])
}
