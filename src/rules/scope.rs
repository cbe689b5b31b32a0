//! Evaluation scope over an exposure record.
//!
//! Variable lookup is case- and underscore-insensitive: `exposure_id`,
//! `exposureId` and `exposure_Id` resolve to the same slot. Insertion is
//! first-seen-wins, so a collision between two spellings keeps the first
//! binding deterministically.

use super::expr::{Scope, Value};
use crate::models::ExposureRecord;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Lowercase and strip underscores; the shared normalization for variable
/// slots.
pub fn normalize_var(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct ExposureScope {
    values: HashMap<String, Value>,
}

impl ExposureScope {
    /// First-seen-wins insert under the normalized key.
    pub fn insert(&mut self, name: &str, value: Value) {
        self.values.entry(normalize_var(name)).or_insert(value);
    }

    pub fn from_exposure(record: &ExposureRecord) -> Self {
        fn opt_str(value: &Option<String>) -> Value {
            match value {
                Some(s) => Value::Str(s.clone()),
                None => Value::Null,
            }
        }
        fn opt_num(value: &Option<Decimal>) -> Value {
            match value {
                Some(n) => Value::Num(*n),
                None => Value::Null,
            }
        }
        fn opt_date(value: &Option<chrono::NaiveDate>) -> Value {
            match value {
                Some(d) => Value::Date(*d),
                None => Value::Null,
            }
        }

        let mut scope = Self::default();
        scope.insert("exposure_id", Value::Str(record.exposure_id.clone()));
        scope.insert("reference_number", opt_str(&record.reference_number));
        scope.insert("counterparty_id", opt_str(&record.counterparty_id));
        scope.insert("counterparty_lei", opt_str(&record.counterparty_lei));
        scope.insert("counterparty_type", opt_str(&record.counterparty_type));
        scope.insert("sector", opt_str(&record.sector));
        scope.insert("country_code", opt_str(&record.country_code));
        scope.insert("exposure_amount", Value::Num(record.exposure_amount));
        scope.insert("currency", Value::Str(record.currency.clone()));
        scope.insert("product_type", opt_str(&record.product_type));
        scope.insert("internal_rating", opt_str(&record.internal_rating));
        scope.insert("risk_category", opt_str(&record.risk_category));
        scope.insert("risk_weight", opt_num(&record.risk_weight));
        scope.insert("reporting_date", opt_date(&record.reporting_date));
        scope.insert("valuation_date", opt_date(&record.valuation_date));
        scope.insert("maturity_date", opt_date(&record.maturity_date));

        // Derived helpers available to rule authors.
        scope.insert(
            "is_corporate_exposure",
            Value::Bool(record.is_corporate_exposure()),
        );
        scope.insert("is_term_exposure", Value::Bool(record.is_term_exposure()));

        // Entity metadata for exemption-aware expressions.
        scope.insert("entity_type", Value::Str("EXPOSURE".to_string()));
        scope.insert("entity_id", Value::Str(record.exposure_id.clone()));

        scope
    }
}

impl Scope for ExposureScope {
    fn get(&self, name: &str) -> Option<Value> {
        self.values.get(&normalize_var(name)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record() -> ExposureRecord {
        ExposureRecord {
            exposure_id: "E1".to_string(),
            reference_number: None,
            counterparty_id: Some("CP9".to_string()),
            counterparty_lei: None,
            counterparty_type: Some("CORPORATE".to_string()),
            sector: None,
            country_code: Some("IT".to_string()),
            exposure_amount: dec!(42.5),
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

    #[test]
    fn test_spelling_variants_resolve_to_same_slot() {
        let scope = ExposureScope::from_exposure(&record());
        for spelling in ["exposure_id", "exposureId", "exposure_Id", "EXPOSURE_ID"] {
            assert_eq!(scope.get(spelling), Some(Value::Str("E1".to_string())));
        }
    }

    #[test]
    fn test_first_seen_wins_on_collision() {
        let mut scope = ExposureScope::default();
        scope.insert("exposure_id", Value::Str("first".to_string()));
        scope.insert("exposureId", Value::Str("second".to_string()));
        assert_eq!(scope.get("exposure_id"), Some(Value::Str("first".to_string())));
    }

    #[test]
    fn test_missing_fields_are_null() {
        let scope = ExposureScope::from_exposure(&record());
        assert_eq!(scope.get("reference_number"), Some(Value::Null));
        assert_eq!(scope.get("maturity_date"), Some(Value::Null));
        assert_eq!(scope.get("not_a_field"), None);
    }

    #[test]
    fn test_derived_helpers_present() {
        let scope = ExposureScope::from_exposure(&record());
        assert_eq!(scope.get("is_corporate_exposure"), Some(Value::Bool(true)));
        assert_eq!(scope.get("isTermExposure"), Some(Value::Bool(false)));
        assert_eq!(scope.get("entity_type"), Some(Value::Str("EXPOSURE".to_string())));
    }
}
