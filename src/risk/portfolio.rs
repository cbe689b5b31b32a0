//! Portfolio breakdowns and concentration indices.
//!
//! HHI is the sum of squared category share fractions, so it lies in
//! `[1/k, 1]` for `k` non-empty categories. A zero-total portfolio returns
//! an all-zero analysis with a STABLE trend rather than erroring.

use crate::models::{
    BreakdownSlice, ClassifiedExposure, PortfolioAnalysis, PortfolioTrend,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

pub struct PortfolioAnalyzer;

impl PortfolioAnalyzer {
    pub fn analyze(
        batch_id: &str,
        classified: &[ClassifiedExposure],
        analyzed_at: DateTime<Utc>,
    ) -> PortfolioAnalysis {
        let total: Decimal = classified.iter().map(|c| c.eur_amount).sum();

        if total.is_zero() {
            return PortfolioAnalysis {
                batch_id: batch_id.to_string(),
                total_portfolio: Decimal::ZERO,
                geographic_breakdown: BTreeMap::new(),
                sector_breakdown: BTreeMap::new(),
                geographic_hhi: Decimal::ZERO,
                sector_hhi: Decimal::ZERO,
                trend: PortfolioTrend::Stable,
                analyzed_at,
            };
        }

        let mut by_region: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut by_sector: BTreeMap<String, Decimal> = BTreeMap::new();
        for exposure in classified {
            *by_region
                .entry(exposure.geographic_region.as_str().to_string())
                .or_insert(Decimal::ZERO) += exposure.eur_amount;
            *by_sector
                .entry(exposure.economic_sector.as_str().to_string())
                .or_insert(Decimal::ZERO) += exposure.eur_amount;
        }

        let geographic_breakdown = breakdown(&by_region, total);
        let sector_breakdown = breakdown(&by_sector, total);

        PortfolioAnalysis {
            batch_id: batch_id.to_string(),
            total_portfolio: total,
            geographic_hhi: hhi(&by_region, total),
            sector_hhi: hhi(&by_sector, total),
            geographic_breakdown,
            sector_breakdown,
            trend: PortfolioTrend::Stable,
            analyzed_at,
        }
    }
}

fn breakdown(
    amounts: &BTreeMap<String, Decimal>,
    total: Decimal,
) -> BTreeMap<String, BreakdownSlice> {
    amounts
        .iter()
        .map(|(category, amount)| {
            (
                category.clone(),
                BreakdownSlice {
                    amount_eur: *amount,
                    percentage: *amount / total * Decimal::from(100),
                },
            )
        })
        .collect()
}

/// `Σ sᵢ²` over share fractions `sᵢ ∈ [0, 1]`.
fn hhi(amounts: &BTreeMap<String, Decimal>, total: Decimal) -> Decimal {
    amounts
        .values()
        .map(|amount| {
            let share = *amount / total;
            share * share
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EconomicSector, ExposureRecord, GeographicRegion};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn classified(
        amount: Decimal,
        region: GeographicRegion,
        sector: EconomicSector,
    ) -> ClassifiedExposure {
        ClassifiedExposure {
            record: ExposureRecord {
                exposure_id: "E".to_string(),
                reference_number: None,
                counterparty_id: None,
                counterparty_lei: None,
                counterparty_type: None,
                sector: None,
                country_code: None,
                exposure_amount: amount,
                currency: "EUR".to_string(),
                product_type: None,
                internal_rating: None,
                risk_category: None,
                risk_weight: None,
                reporting_date: None,
                valuation_date: None,
                maturity_date: None,
            },
            eur_amount: amount,
            mitigated_amount_eur: amount,
            geographic_region: region,
            economic_sector: sector,
            exchange_rate_used: Decimal::ONE,
            rate_date: NaiveDate::from_ymd_opt(2025, 6, 30).unwrap(),
        }
    }

    #[test]
    fn test_percentages_sum_to_100() {
        let exposures = vec![
            classified(dec!(300), GeographicRegion::Italy, EconomicSector::Corporate),
            classified(dec!(400), GeographicRegion::EuOther, EconomicSector::Banking),
            classified(dec!(300), GeographicRegion::NonEuropean, EconomicSector::Other),
        ];
        let analysis = PortfolioAnalyzer::analyze("b1", &exposures, Utc::now());
        assert_eq!(analysis.total_portfolio, dec!(1000));
        let sum: Decimal = analysis
            .geographic_breakdown
            .values()
            .map(|s| s.percentage)
            .sum();
        assert!((sum - dec!(100)).abs() < dec!(0.000001));
        assert_eq!(
            analysis.geographic_breakdown.get("ITALY").unwrap().amount_eur,
            dec!(300)
        );
    }

    #[test]
    fn test_hhi_bounds() {
        // Evenly split over 4 categories: HHI = 4 * (1/4)^2 = 0.25 = 1/k.
        let exposures = vec![
            classified(dec!(250), GeographicRegion::Italy, EconomicSector::Corporate),
            classified(dec!(250), GeographicRegion::EuOther, EconomicSector::Banking),
            classified(dec!(250), GeographicRegion::NonEuropean, EconomicSector::Sovereign),
            classified(dec!(250), GeographicRegion::Italy, EconomicSector::RetailMortgage),
        ];
        let analysis = PortfolioAnalyzer::analyze("b1", &exposures, Utc::now());
        assert!((analysis.sector_hhi - dec!(0.25)).abs() < dec!(0.000001));
        assert!(analysis.sector_hhi >= dec!(0.25) - dec!(0.000001));
        assert!(analysis.sector_hhi <= Decimal::ONE);
    }

    #[test]
    fn test_single_category_hhi_is_one() {
        let exposures = vec![
            classified(dec!(10), GeographicRegion::Italy, EconomicSector::Corporate),
            classified(dec!(90), GeographicRegion::Italy, EconomicSector::Corporate),
        ];
        let analysis = PortfolioAnalyzer::analyze("b1", &exposures, Utc::now());
        assert_eq!(analysis.geographic_hhi, Decimal::ONE);
        assert_eq!(analysis.sector_hhi, Decimal::ONE);
    }

    #[test]
    fn test_zero_total_portfolio_is_empty_and_stable() {
        let analysis = PortfolioAnalyzer::analyze("b1", &[], Utc::now());
        assert_eq!(analysis.total_portfolio, Decimal::ZERO);
        assert!(analysis.geographic_breakdown.is_empty());
        assert_eq!(analysis.geographic_hhi, Decimal::ZERO);
        assert_eq!(analysis.trend, PortfolioTrend::Stable);
    }

    #[test]
    fn test_concentrated_portfolio_hhi_near_one() {
        let exposures = vec![
            classified(dec!(990), GeographicRegion::Italy, EconomicSector::Corporate),
            classified(dec!(10), GeographicRegion::EuOther, EconomicSector::Banking),
        ];
        let analysis = PortfolioAnalyzer::analyze("b1", &exposures, Utc::now());
        assert!(analysis.geographic_hhi > dec!(0.98));
        assert!(analysis.geographic_hhi < Decimal::ONE);
    }
}
