//! Six-dimension quality scoring.
//!
//! Each dimension score subtracts a severity-weighted violation ratio from
//! 100, clamped to [0, 100]. The uniqueness dimension is special-cased: its
//! score comes from the duplicate validator's distinct-record formula.

use crate::models::{QualityDimension, QualityGrade, QualityScores, RuleSeverity, RuleViolation};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};

pub const SEVERITY_WEIGHT_CRITICAL: Decimal = dec!(1.0);
pub const SEVERITY_WEIGHT_HIGH: Decimal = dec!(0.6);
pub const SEVERITY_WEIGHT_MEDIUM: Decimal = dec!(0.3);
pub const SEVERITY_WEIGHT_LOW: Decimal = dec!(0.1);

fn severity_weight(severity: RuleSeverity) -> Decimal {
    match severity {
        RuleSeverity::Critical => SEVERITY_WEIGHT_CRITICAL,
        RuleSeverity::High => SEVERITY_WEIGHT_HIGH,
        RuleSeverity::Medium => SEVERITY_WEIGHT_MEDIUM,
        RuleSeverity::Low => SEVERITY_WEIGHT_LOW,
    }
}

pub struct QualityScorer {
    weights: [Decimal; 6],
}

impl QualityScorer {
    pub fn new(weights: [Decimal; 6]) -> Self {
        Self { weights }
    }

    /// Scores a batch. `uniqueness_score` overrides the subtraction formula
    /// for the uniqueness dimension when present.
    pub fn score(
        &self,
        violations: &[RuleViolation],
        total_exposures: usize,
        uniqueness_score: Option<Decimal>,
    ) -> QualityScores {
        let mut weighted: HashMap<QualityDimension, Decimal> = HashMap::new();
        for violation in violations {
            *weighted.entry(violation.dimension).or_insert(Decimal::ZERO) +=
                severity_weight(violation.severity);
        }

        let mut dimension_scores = BTreeMap::new();
        let mut per_dim: Vec<(QualityDimension, Decimal)> = Vec::with_capacity(6);
        for dimension in QualityDimension::ALL {
            let score = if dimension == QualityDimension::Uniqueness {
                match uniqueness_score {
                    Some(s) => clamp_score(s),
                    None => self.subtraction_score(&weighted, dimension, total_exposures),
                }
            } else {
                self.subtraction_score(&weighted, dimension, total_exposures)
            };
            dimension_scores.insert(dimension.as_str().to_string(), score);
            per_dim.push((dimension, score));
        }

        let mut overall = Decimal::ZERO;
        for (i, (_, score)) in per_dim.iter().enumerate() {
            overall += self.weights[i] * *score;
        }
        let overall = clamp_score(overall.round_dp(2));

        QualityScores {
            dimension_scores,
            overall_score: overall,
            grade: grade_of(overall),
        }
    }

    fn subtraction_score(
        &self,
        weighted: &HashMap<QualityDimension, Decimal>,
        dimension: QualityDimension,
        total_exposures: usize,
    ) -> Decimal {
        if total_exposures == 0 {
            return Decimal::from(100);
        }
        let burden = weighted.get(&dimension).copied().unwrap_or(Decimal::ZERO);
        let ratio = burden / Decimal::from(total_exposures);
        clamp_score((Decimal::from(100) - ratio * Decimal::from(100)).round_dp(2))
    }
}

fn clamp_score(score: Decimal) -> Decimal {
    score.max(Decimal::ZERO).min(Decimal::from(100))
}

/// Fixed thresholds: >=95 A+, >=90 A, >=80 B, >=70 C, else F.
pub fn grade_of(overall: Decimal) -> QualityGrade {
    if overall >= Decimal::from(95) {
        QualityGrade::APlus
    } else if overall >= Decimal::from(90) {
        QualityGrade::A
    } else if overall >= Decimal::from(80) {
        QualityGrade::B
    } else if overall >= Decimal::from(70) {
        QualityGrade::C
    } else {
        QualityGrade::F
    }
}

/// Lowest-scoring dimension; ties broken by declaration order.
pub fn lowest_scoring_dimension(scores: &QualityScores) -> QualityDimension {
    extreme_dimension(scores, |candidate, best| candidate < best)
}

/// Highest-scoring dimension; ties broken by declaration order.
pub fn highest_scoring_dimension(scores: &QualityScores) -> QualityDimension {
    extreme_dimension(scores, |candidate, best| candidate > best)
}

fn extreme_dimension(
    scores: &QualityScores,
    better: impl Fn(Decimal, Decimal) -> bool,
) -> QualityDimension {
    let mut best = QualityDimension::ALL[0];
    let mut best_score = scores
        .dimension_scores
        .get(best.as_str())
        .copied()
        .unwrap_or(Decimal::from(100));
    for dimension in QualityDimension::ALL.iter().skip(1) {
        let score = scores
            .dimension_scores
            .get(dimension.as_str())
            .copied()
            .unwrap_or(Decimal::from(100));
        if better(score, best_score) {
            best = *dimension;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::uniform_quality_weights;
    use chrono::Utc;

    fn violation(dimension: QualityDimension, severity: RuleSeverity) -> RuleViolation {
        RuleViolation {
            batch_id: "b1".to_string(),
            exposure_id: "E1".to_string(),
            rule_id: "R1".to_string(),
            dimension,
            severity,
            field: None,
            message: "failed".to_string(),
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_clean_batch_grades_a_plus() {
        let scorer = QualityScorer::new(uniform_quality_weights());
        let scores = scorer.score(&[], 3, Some(Decimal::from(100)));
        assert_eq!(scores.overall_score, Decimal::from(100));
        assert_eq!(scores.grade, QualityGrade::APlus);
    }

    #[test]
    fn test_dimension_scores_clamped_and_weighted() {
        let scorer = QualityScorer::new(uniform_quality_weights());
        // Two criticals on one exposure out of one: burden 2.0 -> raw -100,
        // clamped to 0.
        let violations = vec![
            violation(QualityDimension::Accuracy, RuleSeverity::Critical),
            violation(QualityDimension::Accuracy, RuleSeverity::Critical),
        ];
        let scores = scorer.score(&violations, 1, None);
        assert_eq!(
            scores.dimension_scores.get("ACCURACY").copied().unwrap(),
            Decimal::ZERO
        );
        for dim in ["COMPLETENESS", "CONSISTENCY", "TIMELINESS", "VALIDITY"] {
            assert_eq!(
                scores.dimension_scores.get(dim).copied().unwrap(),
                Decimal::from(100)
            );
        }
    }

    #[test]
    fn test_uniqueness_override_applies() {
        use rust_decimal_macros::dec;
        let scorer = QualityScorer::new(uniform_quality_weights());
        let scores = scorer.score(&[], 3, Some(dec!(33.33)));
        assert_eq!(
            scores.dimension_scores.get("UNIQUENESS").copied().unwrap(),
            dec!(33.33)
        );
        // (5 * 100 + 33.33) / 6 = 88.89 -> grade B
        assert_eq!(scores.grade, QualityGrade::B);
    }

    #[test]
    fn test_grade_thresholds_are_monotone() {
        use rust_decimal_macros::dec;
        assert_eq!(grade_of(dec!(95)), QualityGrade::APlus);
        assert_eq!(grade_of(dec!(94.99)), QualityGrade::A);
        assert_eq!(grade_of(dec!(90)), QualityGrade::A);
        assert_eq!(grade_of(dec!(89.99)), QualityGrade::B);
        assert_eq!(grade_of(dec!(80)), QualityGrade::B);
        assert_eq!(grade_of(dec!(79.99)), QualityGrade::C);
        assert_eq!(grade_of(dec!(70)), QualityGrade::C);
        assert_eq!(grade_of(dec!(69.99)), QualityGrade::F);
    }

    #[test]
    fn test_tie_break_uses_declaration_order() {
        let scorer = QualityScorer::new(uniform_quality_weights());
        let scores = scorer.score(&[], 1, Some(Decimal::from(100)));
        assert_eq!(
            lowest_scoring_dimension(&scores),
            QualityDimension::Completeness
        );
        assert_eq!(
            highest_scoring_dimension(&scores),
            QualityDimension::Completeness
        );
    }

    #[test]
    fn test_severity_weights_ordering() {
        let scorer = QualityScorer::new(uniform_quality_weights());
        let low = scorer.score(
            &[violation(QualityDimension::Validity, RuleSeverity::Low)],
            10,
            None,
        );
        let critical = scorer.score(
            &[violation(QualityDimension::Validity, RuleSeverity::Critical)],
            10,
            None,
        );
        let low_score = low.dimension_scores.get("VALIDITY").copied().unwrap();
        let critical_score = critical.dimension_scores.get("VALIDITY").copied().unwrap();
        assert!(critical_score < low_score);
    }
}
