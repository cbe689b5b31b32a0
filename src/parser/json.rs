//! JSON exposure-file parsing.

use super::{
    resolve_field, normalize_key, parse_date, parse_decimal, ParseMode, ParsedFile, RawValue,
    RecordBuilder,
};
use crate::errors::{CoreError, CoreResult};
use crate::models::{BankInfo, CrmEntry};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

/// Parses a JSON payload: either a top-level array of records, or an object
/// carrying `records`/`exposures`, an optional `bank_info` sidecar and an
/// optional `crm`/`mitigations` stream.
pub fn parse_json(bytes: &[u8], mode: ParseMode) -> CoreResult<ParsedFile> {
    let root: Value =
        serde_json::from_slice(bytes).map_err(|e| CoreError::parse(format!("invalid json: {e}")))?;

    let mut parsed = ParsedFile::default();

    let records_value = match &root {
        Value::Array(_) => Some(&root),
        Value::Object(map) => {
            parsed.bank_info = map
                .iter()
                .find(|(k, _)| matches!(normalize_key(k).as_str(), "bankinfo" | "bank"))
                .map(|(_, v)| parse_bank_info(v));
            find_key(map, &["records", "exposures"])
        }
        _ => None,
    };

    let Some(Value::Array(items)) = records_value else {
        return Err(CoreError::parse(
            "expected an array of records or an object with a records field",
        ));
    };

    for (index, item) in items.iter().enumerate() {
        match parse_record(item, index) {
            Ok(record) => parsed.records.push(record),
            Err(e) if mode == ParseMode::Lenient => {
                warn!(index, error = %e, "skipping malformed record");
                parsed.skipped.push(index);
            }
            Err(e) => return Err(e),
        }
    }

    if let Value::Object(map) = &root {
        if let Some(Value::Array(entries)) =
            find_key(map, &["crm", "mitigations", "credit_risk_mitigations"])
        {
            for (index, entry) in entries.iter().enumerate() {
                match parse_crm_entry(entry, index) {
                    Ok(Some(crm)) => parsed.crm.push(crm),
                    Ok(None) => {}
                    Err(e) if mode == ParseMode::Lenient => {
                        warn!(index, error = %e, "skipping malformed crm entry");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    Ok(parsed)
}

fn find_key<'a>(
    map: &'a serde_json::Map<String, Value>,
    names: &[&str],
) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| {
            let normalized = normalize_key(k);
            names.iter().any(|n| normalize_key(n) == normalized)
        })
        .map(|(_, v)| v)
}

fn parse_record(item: &Value, index: usize) -> CoreResult<crate::models::ExposureRecord> {
    let Value::Object(map) = item else {
        return Err(CoreError::parse_at(index, "record is not an object"));
    };
    let mut builder = RecordBuilder::default();
    for (key, value) in map {
        if let Some(field) = resolve_field(key) {
            builder.set(field, json_raw_value(value, index)?);
        }
    }
    builder.build(index)
}

fn json_raw_value(value: &Value, index: usize) -> CoreResult<RawValue> {
    Ok(match value {
        Value::Null => RawValue::Null,
        Value::String(s) => RawValue::Str(s.clone()),
        Value::Number(n) => RawValue::Num(
            parse_decimal(&n.to_string())
                .ok_or_else(|| CoreError::parse_at(index, format!("unrepresentable number {n}")))?,
        ),
        Value::Bool(b) => RawValue::Str(b.to_string()),
        other => {
            return Err(CoreError::parse_at(
                index,
                format!("unsupported value type: {other}"),
            ))
        }
    })
}

fn parse_bank_info(value: &Value) -> BankInfo {
    let mut info = BankInfo::default();
    let Value::Object(map) = value else {
        return info;
    };
    for (key, v) in map {
        match normalize_key(key).as_str() {
            "bankname" | "name" => info.bank_name = v.as_str().map(str::to_string),
            "bankcode" | "abicode" | "code" => info.bank_code = string_or_number(v),
            "lei" => info.lei = v.as_str().map(str::to_string),
            "reportingdate" => info.reporting_date = v.as_str().and_then(parse_date),
            "expectedexposurecount" | "exposurecount" => {
                info.expected_exposure_count = v.as_i64()
            }
            _ => {}
        }
    }
    info
}

fn string_or_number(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_crm_entry(value: &Value, index: usize) -> CoreResult<Option<CrmEntry>> {
    let Value::Object(map) = value else {
        return Err(CoreError::parse_at(index, "crm entry is not an object"));
    };
    let mut exposure_id = None;
    let mut protection_amount: Option<Decimal> = None;
    let mut currency = None;
    for (key, v) in map {
        match normalize_key(key).as_str() {
            "exposureid" => exposure_id = v.as_str().map(str::to_string),
            "protectionamount" | "amount" => {
                protection_amount = match v {
                    Value::Number(n) => parse_decimal(&n.to_string()),
                    Value::String(s) => parse_decimal(s),
                    _ => None,
                }
            }
            "currency" => currency = v.as_str().map(|s| s.to_ascii_uppercase()),
            _ => {}
        }
    }
    match (exposure_id, protection_amount) {
        (Some(id), Some(amount)) if !id.is_empty() => Ok(Some(CrmEntry {
            exposure_id: id,
            protection_amount: amount,
            currency: currency.unwrap_or_else(|| "EUR".to_string()),
        })),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_top_level_array() {
        let body = br#"[
            {"exposureId": "E1", "exposureAmount": 1000.50, "currency": "EUR"},
            {"exposure_id": "E2", "exposure_amount": "250.25", "currency": "usd"}
        ]"#;
        let parsed = parse_json(body, ParseMode::Strict).unwrap();
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.records[0].exposure_id, "E1");
        assert_eq!(parsed.records[0].exposure_amount, dec!(1000.50));
        assert_eq!(parsed.records[1].currency, "USD");
    }

    #[test]
    fn test_object_with_records_and_bank_info() {
        let body = br#"{
            "bankInfo": {"bankName": "Banca Test", "bankCode": "08081",
                         "reportingDate": "2025-06-30", "expectedExposureCount": 1},
            "records": [{"exposureId": "E1", "amount": 10, "currency": "EUR"}],
            "crm": [{"exposureId": "E1", "protectionAmount": 4, "currency": "EUR"}]
        }"#;
        let parsed = parse_json(body, ParseMode::Strict).unwrap();
        assert_eq!(parsed.records.len(), 1);
        let bank = parsed.bank_info.unwrap();
        assert_eq!(bank.bank_code.as_deref(), Some("08081"));
        assert_eq!(bank.expected_exposure_count, Some(1));
        assert_eq!(parsed.crm.len(), 1);
        assert_eq!(parsed.crm[0].protection_amount, dec!(4));
    }

    #[test]
    fn test_malformed_record_aborts_strict() {
        let body = br#"[{"exposureId": "E1", "amount": 1, "currency": "EUR"}, 42]"#;
        let err = parse_json(body, ParseMode::Strict).unwrap_err();
        assert_eq!(err.code, "PARSE_ERROR");
        assert!(err.detail.as_deref().unwrap().contains("record 1"));
    }

    #[test]
    fn test_malformed_record_skipped_lenient() {
        let body = br#"[{"exposureId": "E1", "amount": 1, "currency": "EUR"}, 42]"#;
        let parsed = parse_json(body, ParseMode::Lenient).unwrap();
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped, vec![1]);
    }

    #[test]
    fn test_dates_parsed() {
        let body = br#"[{"exposureId": "E1", "amount": 1, "currency": "EUR",
                         "reportingDate": "2025-06-30", "maturity_date": "2030-01-15"}]"#;
        let parsed = parse_json(body, ParseMode::Strict).unwrap();
        let record = &parsed.records[0];
        assert_eq!(
            record.reporting_date,
            chrono::NaiveDate::from_ymd_opt(2025, 6, 30)
        );
        assert!(record.is_term_exposure());
    }

    #[test]
    fn test_non_array_root_rejected() {
        let err = parse_json(br#""just a string""#, ParseMode::Strict).unwrap_err();
        assert_eq!(err.code, "PARSE_ERROR");
    }
}
