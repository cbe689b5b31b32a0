//! Exchange-rate lookup seam.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Rate source: units of EUR per one unit of `currency` on `date`.
/// EUR itself always resolves to 1.
pub trait RateProvider: Send + Sync {
    fn rate(&self, currency: &str, date: NaiveDate) -> Option<Decimal>;
}

/// Static table used by tests and seeded deployments. Exact-date lookup.
#[derive(Debug, Clone, Default)]
pub struct FixedRateProvider {
    rates: HashMap<(String, NaiveDate), Decimal>,
}

impl FixedRateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rate(mut self, currency: &str, date: NaiveDate, rate: Decimal) -> Self {
        self.rates
            .insert((currency.to_ascii_uppercase(), date), rate);
        self
    }
}

/// Rate provider backed by the `fx_rates` table: exact date first, then the
/// most recent prior quote within 7 days.
#[derive(Clone)]
pub struct DbRateProvider {
    db: crate::db::Database,
}

impl DbRateProvider {
    pub fn new(db: crate::db::Database) -> Self {
        Self { db }
    }
}

impl RateProvider for DbRateProvider {
    fn rate(&self, currency: &str, date: NaiveDate) -> Option<Decimal> {
        self.db.fx_rate(currency, date).ok().flatten()
    }
}

impl RateProvider for FixedRateProvider {
    fn rate(&self, currency: &str, date: NaiveDate) -> Option<Decimal> {
        let currency = currency.to_ascii_uppercase();
        if currency == "EUR" {
            return Some(Decimal::ONE);
        }
        self.rates.get(&(currency, date)).copied()
    }
}
