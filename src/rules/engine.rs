//! Cached rule evaluation over a batch.
//!
//! The enabled ruleset is compiled once and published through a process-wide
//! `ArcSwapOption` slot; batches reuse the snapshot until the rules change
//! (or every batch reloads it when cross-batch caching is disabled). The
//! exemption index is per-batch and cleared on completion. The prepared
//! evaluator is pure per exposure and safe to fan out across workers.

use super::expr::{self, EvalContext, Expr, Value};
use super::scope::ExposureScope;
use crate::errors::{CoreError, CoreResult};
use crate::models::{
    BusinessRule, Exemption, ExposureRecord, QualityDimension, RuleSeverity, RuleViolation,
};
use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source seam for rules and exemptions; implemented by the database layer.
pub trait RuleSource {
    fn load_enabled_rules(&self) -> CoreResult<Vec<BusinessRule>>;
    fn load_exemptions(&self, entity_type: &str, entity_ids: &[String])
        -> CoreResult<Vec<Exemption>>;
}

struct CompiledRule {
    rule: BusinessRule,
    /// Parse once per snapshot; a broken expression stays broken for every
    /// exposure and reports as an evaluation error.
    ast: Result<Expr, String>,
}

pub struct RuleSnapshot {
    rules: Vec<CompiledRule>,
    pub loaded_at: DateTime<Utc>,
}

impl RuleSnapshot {
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

/// Per-batch exemption index keyed `(entity_type, entity_id)`.
#[derive(Default)]
pub struct ExemptionIndex {
    by_entity: HashMap<(String, String), Vec<Exemption>>,
}

impl ExemptionIndex {
    fn new(exemptions: Vec<Exemption>) -> Self {
        let mut by_entity: HashMap<(String, String), Vec<Exemption>> = HashMap::new();
        for exemption in exemptions {
            by_entity
                .entry((exemption.entity_type.clone(), exemption.entity_id.clone()))
                .or_default()
                .push(exemption);
        }
        Self { by_entity }
    }

    pub fn is_exempt(
        &self,
        entity_type: &str,
        entity_id: &str,
        rule_id: &str,
        at: DateTime<Utc>,
    ) -> bool {
        self.by_entity
            .get(&(entity_type.to_string(), entity_id.to_string()))
            .map(|entries| entries.iter().any(|e| e.covers(rule_id, at)))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.by_entity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_entity.is_empty()
    }
}

/// Per-exposure evaluation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct EvalStats {
    pub evaluated: usize,
    pub passed: usize,
    pub failed: usize,
    pub exempted: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
pub struct ExposureValidation {
    pub exposure_id: String,
    pub errors: Vec<CoreError>,
    pub violations: Vec<RuleViolation>,
    pub stats: EvalStats,
}

pub struct RuleEngine {
    snapshot: ArcSwapOption<RuleSnapshot>,
    exemptions: ArcSwapOption<ExemptionIndex>,
    /// Serializes snapshot loads; readers never take it.
    load_lock: parking_lot::Mutex<()>,
    cache_across_batches: bool,
}

impl RuleEngine {
    pub fn new(cache_across_batches: bool) -> Self {
        Self {
            snapshot: ArcSwapOption::from(None),
            exemptions: ArcSwapOption::from(None),
            load_lock: parking_lot::Mutex::new(()),
            cache_across_batches,
        }
    }

    /// Loads the enabled ruleset (once) and the exemption index covering the
    /// batch's exposures. Safe to call concurrently; the first caller wins
    /// and later callers reuse the published snapshot.
    pub fn prefetch_for_batch(
        &self,
        source: &dyn RuleSource,
        exposures: &[ExposureRecord],
    ) -> CoreResult<()> {
        // Double-checked initialization: cheap lock-free read first, then
        // re-check under the load lock before compiling.
        if self.snapshot.load().is_none() || !self.cache_across_batches {
            let _guard = self.load_lock.lock();
            if self.snapshot.load().is_none() || !self.cache_across_batches {
                let rules = source.load_enabled_rules()?;
                let compiled: Vec<CompiledRule> = rules
                    .into_iter()
                    .map(|rule| {
                        let ast = expr::parse(&rule.expression).map_err(|e| {
                            warn!(rule_id = %rule.rule_id, error = %e, "rule expression failed to parse");
                            e.message
                        });
                        CompiledRule { rule, ast }
                    })
                    .collect();
                let snapshot = Arc::new(RuleSnapshot {
                    rules: compiled,
                    loaded_at: Utc::now(),
                });
                debug!(rules = snapshot.rule_count(), "rule snapshot published");
                self.snapshot.store(Some(snapshot));
            }
        }

        let entity_ids: Vec<String> = exposures
            .iter()
            .map(|e| e.exposure_id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        let exemptions = source.load_exemptions("EXPOSURE", &entity_ids)?;
        let index = ExemptionIndex::new(exemptions);
        debug!(entities = index.len(), "exemption index loaded");
        self.exemptions.store(Some(Arc::new(index)));
        Ok(())
    }

    /// Returns a pure evaluator over the published snapshot and exemption
    /// index. Panics never: a missing prefetch yields an empty snapshot.
    pub fn prepare_for_batch(&self) -> BatchEvaluator {
        BatchEvaluator {
            snapshot: self.snapshot.load_full(),
            exemptions: self.exemptions.load_full(),
            now: Utc::now(),
        }
    }

    /// Clears the per-batch exemption cache; the rule snapshot is retained
    /// across batches unless cross-batch caching is disabled.
    pub fn on_batch_complete(&self) {
        self.exemptions.store(None);
        if !self.cache_across_batches {
            self.snapshot.store(None);
        }
    }

    /// Drops the published snapshot so the next batch reloads rules.
    pub fn invalidate_rules(&self) {
        self.snapshot.store(None);
    }
}

/// Prepared, shareable evaluator: pure per exposure, `Send + Sync` for
/// rayon fan-out across disjoint exposures.
#[derive(Clone)]
pub struct BatchEvaluator {
    snapshot: Option<Arc<RuleSnapshot>>,
    exemptions: Option<Arc<ExemptionIndex>>,
    now: DateTime<Utc>,
}

impl BatchEvaluator {
    /// Evaluates every rule against one exposure without side effects.
    pub fn validate_no_persist(&self, batch_id: &str, record: &ExposureRecord) -> ExposureValidation {
        let mut result = ExposureValidation {
            exposure_id: record.exposure_id.clone(),
            errors: Vec::new(),
            violations: Vec::new(),
            stats: EvalStats::default(),
        };
        let Some(snapshot) = &self.snapshot else {
            return result;
        };

        let scope = ExposureScope::from_exposure(record);
        let ctx = EvalContext { now: self.now };

        for compiled in &snapshot.rules {
            let rule = &compiled.rule;
            result.stats.evaluated += 1;

            if let Some(index) = &self.exemptions {
                if index.is_exempt("EXPOSURE", &record.exposure_id, &rule.rule_id, self.now) {
                    result.stats.exempted += 1;
                    continue;
                }
            }

            match &compiled.ast {
                Ok(ast) => match expr::eval(ast, &scope, &ctx) {
                    Ok(value) => {
                        if value.truthy() {
                            result.stats.passed += 1;
                        } else {
                            result.stats.failed += 1;
                            result.violations.push(RuleViolation {
                                batch_id: batch_id.to_string(),
                                exposure_id: record.exposure_id.clone(),
                                rule_id: rule.rule_id.clone(),
                                dimension: rule.dimension,
                                severity: rule.severity,
                                field: rule.field.clone(),
                                message: rule.message.clone(),
                                observed_at: self.now,
                            });
                        }
                    }
                    Err(e) => {
                        result.stats.errors += 1;
                        let core = CoreError::evaluation(&rule.rule_id, e.message.clone());
                        debug!(rule_id = %rule.rule_id, error = %e, "rule evaluation error");
                        result.errors.push(core);
                        result.violations.push(evaluation_error_violation(
                            batch_id, record, rule, &e.message, self.now,
                        ));
                    }
                },
                Err(parse_error) => {
                    result.stats.errors += 1;
                    result
                        .errors
                        .push(CoreError::evaluation(&rule.rule_id, parse_error.clone()));
                    result.violations.push(evaluation_error_violation(
                        batch_id, record, rule, parse_error, self.now,
                    ));
                }
            }
        }
        result
    }

    pub fn rule_count(&self) -> usize {
        self.snapshot.as_ref().map(|s| s.rule_count()).unwrap_or(0)
    }
}

/// Evaluator failures surface as MEDIUM violations instead of aborting the
/// batch.
fn evaluation_error_violation(
    batch_id: &str,
    record: &ExposureRecord,
    rule: &BusinessRule,
    detail: &str,
    observed_at: DateTime<Utc>,
) -> RuleViolation {
    RuleViolation {
        batch_id: batch_id.to_string(),
        exposure_id: record.exposure_id.clone(),
        rule_id: rule.rule_id.clone(),
        dimension: rule.dimension,
        severity: RuleSeverity::Medium,
        field: rule.field.clone(),
        message: format!("EVALUATION_ERROR: {detail}"),
        observed_at,
    }
}

/// Truthiness helper re-exported for callers asserting on raw values.
pub fn value_is_truthy(value: &Value) -> bool {
    value.truthy()
}

/// Persistence seam for validation results; implemented by the database
/// layer with a single-transaction batch insert.
pub trait ViolationSink {
    fn persist_violations(&self, batch_id: &str, violations: &[RuleViolation])
        -> CoreResult<usize>;
}

/// Flushes every violation produced by a batch's evaluations in one
/// transaction. Callers that also commit batch state use the combined
/// batch-commit path instead.
pub fn batch_persist_validation_results(
    sink: &dyn ViolationSink,
    batch_id: &str,
    results: &[ExposureValidation],
) -> CoreResult<usize> {
    let violations: Vec<RuleViolation> = results
        .iter()
        .flat_map(|r| r.violations.iter().cloned())
        .collect();
    sink.persist_violations(batch_id, &violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    struct FakeSource {
        rules: Vec<BusinessRule>,
        exemptions: Vec<Exemption>,
        loads: Mutex<usize>,
    }

    impl RuleSource for FakeSource {
        fn load_enabled_rules(&self) -> CoreResult<Vec<BusinessRule>> {
            *self.loads.lock() += 1;
            Ok(self.rules.clone())
        }

        fn load_exemptions(
            &self,
            _entity_type: &str,
            _entity_ids: &[String],
        ) -> CoreResult<Vec<Exemption>> {
            Ok(self.exemptions.clone())
        }
    }

    fn rule(id: &str, expression: &str, severity: RuleSeverity) -> BusinessRule {
        BusinessRule {
            rule_id: id.to_string(),
            enabled: true,
            expression: expression.to_string(),
            dimension: QualityDimension::Completeness,
            severity,
            field: Some("exposure_amount".to_string()),
            message: format!("{id} failed"),
            }
    }

    fn record(id: &str, amount: rust_decimal::Decimal) -> ExposureRecord {
        ExposureRecord {
            exposure_id: id.to_string(),
            reference_number: None,
            counterparty_id: Some("CP1".to_string()),
            counterparty_lei: None,
            counterparty_type: None,
            sector: None,
            country_code: Some("IT".to_string()),
            exposure_amount: amount,
            currency: "EUR".to_string(),
            product_type: None,
            internal_rating: None,
            risk_category: None,
            risk_weight: None,
            reporting_date: None,
            valuation_date: None,
            maturity_date: None,
        }
    }

    fn source(rules: Vec<BusinessRule>, exemptions: Vec<Exemption>) -> FakeSource {
        FakeSource {
            rules,
            exemptions,
            loads: Mutex::new(0),
        }
    }

    #[test]
    fn test_passing_and_failing_rules() {
        let engine = RuleEngine::new(true);
        let src = source(
            vec![
                rule("R1", "exposure_amount > 0", RuleSeverity::Critical),
                rule("R2", "exposure_amount > 1000000", RuleSeverity::High),
            ],
            vec![],
        );
        let records = vec![record("E1", dec!(500))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        let evaluator = engine.prepare_for_batch();

        let outcome = evaluator.validate_no_persist("b1", &records[0]);
        assert_eq!(outcome.stats.evaluated, 2);
        assert_eq!(outcome.stats.passed, 1);
        assert_eq!(outcome.stats.failed, 1);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].rule_id, "R2");
        assert_eq!(outcome.violations[0].severity, RuleSeverity::High);
    }

    #[test]
    fn test_snapshot_cached_across_batches() {
        let engine = RuleEngine::new(true);
        let src = source(vec![rule("R1", "TRUE", RuleSeverity::Low)], vec![]);
        let records = vec![record("E1", dec!(1))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        engine.on_batch_complete();
        engine.prefetch_for_batch(&src, &records).unwrap();
        assert_eq!(*src.loads.lock(), 1);
    }

    #[test]
    fn test_snapshot_reloaded_when_cache_disabled() {
        let engine = RuleEngine::new(false);
        let src = source(vec![rule("R1", "TRUE", RuleSeverity::Low)], vec![]);
        let records = vec![record("E1", dec!(1))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        engine.on_batch_complete();
        engine.prefetch_for_batch(&src, &records).unwrap();
        assert_eq!(*src.loads.lock(), 2);
    }

    #[test]
    fn test_exempted_rule_skipped() {
        let now = Utc::now();
        let engine = RuleEngine::new(true);
        let src = source(
            vec![rule("R1", "exposure_amount > 1000000", RuleSeverity::Critical)],
            vec![Exemption {
                entity_type: "EXPOSURE".to_string(),
                entity_id: "E1".to_string(),
                rule_id: Some("R1".to_string()),
                valid_from: now - chrono::Duration::days(1),
                valid_to: now + chrono::Duration::days(1),
            }],
        );
        let records = vec![record("E1", dec!(5))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        let evaluator = engine.prepare_for_batch();
        let outcome = evaluator.validate_no_persist("b1", &records[0]);
        assert_eq!(outcome.stats.exempted, 1);
        assert!(outcome.violations.is_empty());
    }

    #[test]
    fn test_evaluation_error_becomes_medium_violation() {
        let engine = RuleEngine::new(true);
        let src = source(
            vec![rule("R1", "currency > 5", RuleSeverity::Critical)],
            vec![],
        );
        let records = vec![record("E1", dec!(5))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        let outcome = engine
            .prepare_for_batch()
            .validate_no_persist("b1", &records[0]);
        assert_eq!(outcome.stats.errors, 1);
        assert_eq!(outcome.violations.len(), 1);
        assert_eq!(outcome.violations[0].severity, RuleSeverity::Medium);
        assert!(outcome.violations[0].message.starts_with("EVALUATION_ERROR"));
    }

    #[test]
    fn test_unparseable_rule_reports_every_exposure() {
        let engine = RuleEngine::new(true);
        let src = source(vec![rule("R1", "((broken", RuleSeverity::Low)], vec![]);
        let records = vec![record("E1", dec!(1)), record("E2", dec!(2))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        let evaluator = engine.prepare_for_batch();
        for r in &records {
            let outcome = evaluator.validate_no_persist("b1", r);
            assert_eq!(outcome.stats.errors, 1);
        }
    }

    #[test]
    fn test_exemption_cache_cleared_on_complete() {
        let engine = RuleEngine::new(true);
        let src = source(vec![rule("R1", "TRUE", RuleSeverity::Low)], vec![]);
        let records = vec![record("E1", dec!(1))];
        engine.prefetch_for_batch(&src, &records).unwrap();
        engine.on_batch_complete();
        let evaluator = engine.prepare_for_batch();
        assert!(evaluator.exemptions.is_none());
    }

    #[test]
    fn test_parallel_fanout_is_consistent() {
        use rayon::prelude::*;
        let engine = RuleEngine::new(true);
        let src = source(
            vec![rule("R1", "exposure_amount > 10", RuleSeverity::High)],
            vec![],
        );
        let records: Vec<ExposureRecord> =
            (0..64).map(|i| record(&format!("E{i}"), dec!(5))).collect();
        engine.prefetch_for_batch(&src, &records).unwrap();
        let evaluator = engine.prepare_for_batch();
        let violation_count: usize = records
            .par_iter()
            .map(|r| evaluator.validate_no_persist("b1", r).violations.len())
            .sum();
        assert_eq!(violation_count, 64);
    }
}
