//! Inbound file parsing.
//!
//! Accepts JSON (array of records, or an object with a records field) and
//! tabular files (CSV, XLSX). Field names arrive in snake_case or camelCase
//! interchangeably; a single alias map normalizes both spellings onto the
//! canonical record fields. A malformed record aborts the batch with a
//! `PARSE_ERROR` carrying the record index, unless lenient mode is enabled.

mod json;
mod tabular;

pub use json::parse_json;
pub use tabular::{parse_csv, parse_xlsx};

use crate::errors::{CoreError, CoreResult};
use crate::models::{BankInfo, CrmEntry, ExposureRecord};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parsed content of one inbound file.
#[derive(Debug, Clone, Default)]
pub struct ParsedFile {
    pub bank_info: Option<BankInfo>,
    pub records: Vec<ExposureRecord>,
    pub crm: Vec<CrmEntry>,
    /// Indexes of records skipped in lenient mode.
    pub skipped: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    Json,
    Csv,
    Xlsx,
}

/// Resolves the format from file name extension and declared content type.
pub fn detect_format(file_name: &str, content_type: &str) -> Option<FileFormat> {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".json") || content_type.contains("json") {
        return Some(FileFormat::Json);
    }
    if lower.ends_with(".csv") || content_type.contains("csv") {
        return Some(FileFormat::Csv);
    }
    if lower.ends_with(".xlsx") || lower.ends_with(".xls") || content_type.contains("spreadsheet") {
        return Some(FileFormat::Xlsx);
    }
    None
}

/// Parsing behavior for malformed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// One malformed record fails the whole file. Default.
    Strict,
    /// Malformed records are skipped and counted.
    Lenient,
}

pub fn parse_file(format: FileFormat, bytes: &[u8], mode: ParseMode) -> CoreResult<ParsedFile> {
    match format {
        FileFormat::Json => parse_json(bytes, mode),
        FileFormat::Csv => parse_csv(bytes, mode),
        FileFormat::Xlsx => parse_xlsx(bytes, mode),
    }
}

// ---------------------------------------------------------------------------
// Field normalization
// ---------------------------------------------------------------------------

/// Canonical record fields the alias map resolves onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    ExposureId,
    ReferenceNumber,
    CounterpartyId,
    CounterpartyLei,
    CounterpartyType,
    Sector,
    CountryCode,
    ExposureAmount,
    Currency,
    ProductType,
    InternalRating,
    RiskCategory,
    RiskWeight,
    ReportingDate,
    ValuationDate,
    MaturityDate,
}

/// snake_case and camelCase collapse onto the same slot: lowercase and strip
/// underscores before lookup.
pub(crate) fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

pub(crate) fn resolve_field(key: &str) -> Option<Field> {
    match normalize_key(key).as_str() {
        "exposureid" | "id" => Some(Field::ExposureId),
        "referencenumber" | "reference" => Some(Field::ReferenceNumber),
        "counterpartyid" => Some(Field::CounterpartyId),
        "counterpartylei" | "lei" => Some(Field::CounterpartyLei),
        "counterpartytype" => Some(Field::CounterpartyType),
        "sector" => Some(Field::Sector),
        "countrycode" | "country" => Some(Field::CountryCode),
        "exposureamount" | "amount" => Some(Field::ExposureAmount),
        "currency" | "currencycode" => Some(Field::Currency),
        "producttype" | "product" => Some(Field::ProductType),
        "internalrating" | "rating" => Some(Field::InternalRating),
        "riskcategory" => Some(Field::RiskCategory),
        "riskweight" => Some(Field::RiskWeight),
        "reportingdate" => Some(Field::ReportingDate),
        "valuationdate" => Some(Field::ValuationDate),
        "maturitydate" => Some(Field::MaturityDate),
        _ => None,
    }
}

/// Raw cell value before typing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RawValue {
    Str(String),
    Num(Decimal),
    Null,
}

impl RawValue {
    fn as_opt_string(&self) -> Option<String> {
        match self {
            RawValue::Str(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            RawValue::Num(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            RawValue::Num(n) => Some(*n),
            RawValue::Str(s) => parse_decimal(s),
            RawValue::Null => None,
        }
    }

    fn as_date(&self) -> Option<NaiveDate> {
        match self {
            RawValue::Str(s) => parse_date(s),
            _ => None,
        }
    }
}

pub(crate) fn parse_decimal(s: &str) -> Option<Decimal> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .ok()
        .or_else(|| Decimal::from_scientific(s).ok())
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .ok()
}

/// Accumulates `(field, value)` pairs into an exposure record. First-seen
/// wins on alias collision, matching the evaluation-scope contract.
#[derive(Debug, Default)]
pub(crate) struct RecordBuilder {
    exposure_id: Option<String>,
    reference_number: Option<String>,
    counterparty_id: Option<String>,
    counterparty_lei: Option<String>,
    counterparty_type: Option<String>,
    sector: Option<String>,
    country_code: Option<String>,
    exposure_amount: Option<RawValue>,
    currency: Option<String>,
    product_type: Option<String>,
    internal_rating: Option<String>,
    risk_category: Option<String>,
    risk_weight: Option<RawValue>,
    reporting_date: Option<RawValue>,
    valuation_date: Option<RawValue>,
    maturity_date: Option<RawValue>,
}

impl RecordBuilder {
    pub fn set(&mut self, field: Field, value: RawValue) {
        match field {
            Field::ExposureId => set_once(&mut self.exposure_id, value.as_opt_string()),
            Field::ReferenceNumber => set_once(&mut self.reference_number, value.as_opt_string()),
            Field::CounterpartyId => set_once(&mut self.counterparty_id, value.as_opt_string()),
            Field::CounterpartyLei => set_once(&mut self.counterparty_lei, value.as_opt_string()),
            Field::CounterpartyType => set_once(&mut self.counterparty_type, value.as_opt_string()),
            Field::Sector => set_once(&mut self.sector, value.as_opt_string()),
            Field::CountryCode => {
                set_once(&mut self.country_code, value.as_opt_string().map(|c| c.to_ascii_uppercase()))
            }
            Field::ExposureAmount => set_once(&mut self.exposure_amount, Some(value)),
            Field::Currency => {
                set_once(&mut self.currency, value.as_opt_string().map(|c| c.to_ascii_uppercase()))
            }
            Field::ProductType => set_once(&mut self.product_type, value.as_opt_string()),
            Field::InternalRating => set_once(&mut self.internal_rating, value.as_opt_string()),
            Field::RiskCategory => set_once(&mut self.risk_category, value.as_opt_string()),
            Field::RiskWeight => set_once(&mut self.risk_weight, Some(value)),
            Field::ReportingDate => set_once(&mut self.reporting_date, Some(value)),
            Field::ValuationDate => set_once(&mut self.valuation_date, Some(value)),
            Field::MaturityDate => set_once(&mut self.maturity_date, Some(value)),
        }
    }

    /// Finishes the record. `index` is the zero-based record position used
    /// in parse errors.
    pub fn build(self, index: usize) -> CoreResult<ExposureRecord> {
        let exposure_amount = match &self.exposure_amount {
            None => Decimal::ZERO,
            Some(RawValue::Null) => Decimal::ZERO,
            Some(v) => v
                .as_decimal()
                .ok_or_else(|| CoreError::parse_at(index, "unparseable exposure_amount"))?,
        };
        let risk_weight = match &self.risk_weight {
            None | Some(RawValue::Null) => None,
            Some(v) => Some(
                v.as_decimal()
                    .ok_or_else(|| CoreError::parse_at(index, "unparseable risk_weight"))?,
            ),
        };
        let reporting_date = opt_date(&self.reporting_date, index, "reporting_date")?;
        let valuation_date = opt_date(&self.valuation_date, index, "valuation_date")?;
        let maturity_date = opt_date(&self.maturity_date, index, "maturity_date")?;

        Ok(ExposureRecord {
            exposure_id: self.exposure_id.unwrap_or_default(),
            reference_number: self.reference_number,
            counterparty_id: self.counterparty_id,
            counterparty_lei: self.counterparty_lei,
            counterparty_type: self.counterparty_type,
            sector: self.sector,
            country_code: self.country_code,
            exposure_amount,
            currency: self.currency.unwrap_or_default(),
            product_type: self.product_type,
            internal_rating: self.internal_rating,
            risk_category: self.risk_category,
            risk_weight,
            reporting_date,
            valuation_date,
            maturity_date,
        })
    }
}

fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        if let Some(v) = value {
            *slot = Some(v);
        }
    }
}

fn opt_date(
    value: &Option<RawValue>,
    index: usize,
    field: &str,
) -> CoreResult<Option<NaiveDate>> {
    match value {
        None | Some(RawValue::Null) => Ok(None),
        Some(v) => match v {
            RawValue::Str(s) if s.trim().is_empty() => Ok(None),
            _ => v
                .as_date()
                .map(Some)
                .ok_or_else(|| CoreError::parse_at(index, format!("unparseable {field}"))),
        },
    }
}
