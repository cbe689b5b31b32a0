//! Risk calculation and portfolio analysis: EUR conversion, credit-risk
//! mitigation, classification and concentration metrics.

pub mod calculator;
pub mod fx;
pub mod portfolio;

pub use calculator::{CalculationOutcome, RecordCalcError, RiskCalculator};
pub use fx::{DbRateProvider, FixedRateProvider, RateProvider};
pub use portfolio::PortfolioAnalyzer;
