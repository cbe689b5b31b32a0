//! Duplicate detection over a parsed batch.
//!
//! Three independent checks: exposure-id uniqueness (CRITICAL), reference
//! number uniqueness (HIGH, blanks skipped) and content duplicates (HIGH)
//! over a SHA-256 of a fixed, ordered field list that excludes the two
//! identifier fields. Every record in a duplicate group yields its own
//! violation.

use crate::models::{ExposureRecord, QualityDimension, RuleSeverity, RuleViolation};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Bumped whenever the content-hash field list changes, so stored hashes
/// from different versions never collide silently.
pub const CONTENT_HASH_VERSION: &str = "content-v1";

pub const RULE_EXPOSURE_ID_DUPLICATE: &str = "UNIQUENESS_EXPOSURE_ID_DUPLICATE";
pub const RULE_REFERENCE_NUMBER_DUPLICATE: &str = "UNIQUENESS_REFERENCE_NUMBER_DUPLICATE";
pub const RULE_CONTENT_DUPLICATE: &str = "UNIQUENESS_CONTENT_DUPLICATE";

#[derive(Debug, Clone, Default)]
pub struct CheckSummary {
    pub groups: usize,
    pub duplicate_records: usize,
}

#[derive(Debug, Clone)]
pub struct UniquenessReport {
    pub violations: Vec<RuleViolation>,
    pub exposure_id_summary: CheckSummary,
    pub reference_summary: CheckSummary,
    pub content_summary: CheckSummary,
    /// `(total - distinct exposures with any violation) / total * 100`.
    pub uniqueness_score: Decimal,
}

pub struct UniquenessValidator;

impl UniquenessValidator {
    pub fn validate(
        batch_id: &str,
        records: &[ExposureRecord],
        observed_at: DateTime<Utc>,
    ) -> UniquenessReport {
        let mut violations = Vec::new();
        let mut flagged: HashSet<usize> = HashSet::new();

        let exposure_id_summary = check_groups(
            records,
            |r| {
                let id = r.exposure_id.trim();
                (!id.is_empty()).then(|| id.to_string())
            },
            RULE_EXPOSURE_ID_DUPLICATE,
            RuleSeverity::Critical,
            Some("exposure_id"),
            |id| format!("duplicate exposure_id '{id}'"),
            batch_id,
            observed_at,
            &mut violations,
            &mut flagged,
        );

        let reference_summary = check_groups(
            records,
            |r| {
                r.reference_number
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
            },
            RULE_REFERENCE_NUMBER_DUPLICATE,
            RuleSeverity::High,
            Some("reference_number"),
            |id| format!("duplicate reference_number '{id}'"),
            batch_id,
            observed_at,
            &mut violations,
            &mut flagged,
        );

        let content_summary = check_groups(
            records,
            |r| Some(content_hash(r)),
            RULE_CONTENT_DUPLICATE,
            RuleSeverity::High,
            None,
            |hash| format!("content duplicate ({CONTENT_HASH_VERSION} hash {hash})"),
            batch_id,
            observed_at,
            &mut violations,
            &mut flagged,
        );

        let total = records.len();
        let uniqueness_score = if total == 0 {
            Decimal::from(100)
        } else {
            let clean = total - flagged.len();
            (Decimal::from(clean) / Decimal::from(total) * Decimal::from(100))
                .round_dp(2)
        };

        UniquenessReport {
            violations,
            exposure_id_summary,
            reference_summary,
            content_summary,
            uniqueness_score,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn check_groups<K: FnMut(&ExposureRecord) -> Option<String>, M: Fn(&str) -> String>(
    records: &[ExposureRecord],
    mut key_of: K,
    rule_id: &str,
    severity: RuleSeverity,
    field: Option<&str>,
    message_of: M,
    batch_id: &str,
    observed_at: DateTime<Utc>,
    violations: &mut Vec<RuleViolation>,
    flagged: &mut HashSet<usize>,
) -> CheckSummary {
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        if let Some(key) = key_of(record) {
            groups.entry(key).or_default().push(index);
        }
    }

    let mut summary = CheckSummary::default();
    let mut duplicate_groups: Vec<(&String, &Vec<usize>)> =
        groups.iter().filter(|(_, members)| members.len() > 1).collect();
    duplicate_groups.sort_by_key(|(_, members)| members[0]);

    for (key, members) in duplicate_groups {
        summary.groups += 1;
        for &index in members {
            summary.duplicate_records += 1;
            flagged.insert(index);
            violations.push(RuleViolation {
                batch_id: batch_id.to_string(),
                exposure_id: records[index].exposure_id.clone(),
                rule_id: rule_id.to_string(),
                dimension: QualityDimension::Uniqueness,
                severity,
                field: field.map(str::to_string),
                message: message_of(key),
                observed_at,
            });
        }
    }
    summary
}

/// Canonical content hash over the fixed field order, identifiers excluded.
/// The ordering and the null-to-empty convention are part of the contract.
pub fn content_hash(record: &ExposureRecord) -> String {
    fn opt(value: &Option<String>) -> &str {
        value.as_deref().unwrap_or("")
    }
    fn opt_date(value: &Option<chrono::NaiveDate>) -> String {
        value.map(|d| d.to_string()).unwrap_or_default()
    }
    fn opt_dec(value: &Option<Decimal>) -> String {
        value.map(|d| d.to_string()).unwrap_or_default()
    }

    let canonical = [
        opt(&record.counterparty_id).to_string(),
        opt(&record.counterparty_lei).to_string(),
        opt(&record.sector).to_string(),
        opt(&record.country_code).to_string(),
        record.exposure_amount.to_string(),
        record.currency.clone(),
        opt_date(&record.reporting_date),
        opt_date(&record.valuation_date),
        opt_date(&record.maturity_date),
        opt_dec(&record.risk_weight),
        opt(&record.product_type).to_string(),
        opt(&record.counterparty_type).to_string(),
        opt(&record.internal_rating).to_string(),
        opt(&record.risk_category).to_string(),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}
