//! Tabular exposure-file parsing (CSV and XLSX).
//!
//! The first row is the header; headers run through the same alias map as
//! JSON keys, so `exposure_id` and `exposureId` columns are equivalent.

use super::{resolve_field, Field, ParseMode, ParsedFile, RawValue, RecordBuilder};
use crate::errors::{CoreError, CoreResult};
use calamine::{Data, Reader};
use rust_decimal::Decimal;
use std::io::Cursor;
use std::str::FromStr;
use tracing::warn;

pub fn parse_csv(bytes: &[u8], mode: ParseMode) -> CoreResult<ParsedFile> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| CoreError::parse(format!("csv header: {e}")))?
        .clone();
    let columns: Vec<Option<Field>> = headers.iter().map(resolve_field).collect();

    let mut parsed = ParsedFile::default();
    for (index, row) in reader.records().enumerate() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                if mode == ParseMode::Lenient {
                    warn!(index, error = %e, "skipping malformed csv row");
                    parsed.skipped.push(index);
                    continue;
                }
                return Err(CoreError::parse_at(index, format!("csv row: {e}")));
            }
        };

        let mut builder = RecordBuilder::default();
        for (column, value) in columns.iter().zip(row.iter()) {
            if let Some(field) = column {
                let raw = if value.is_empty() {
                    RawValue::Null
                } else {
                    RawValue::Str(value.to_string())
                };
                builder.set(*field, raw);
            }
        }
        match builder.build(index) {
            Ok(record) => parsed.records.push(record),
            Err(e) if mode == ParseMode::Lenient => {
                warn!(index, error = %e, "skipping malformed csv record");
                parsed.skipped.push(index);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(parsed)
}

pub fn parse_xlsx(bytes: &[u8], mode: ParseMode) -> CoreResult<ParsedFile> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = calamine::open_workbook_auto_from_rs(cursor)
        .map_err(|e| CoreError::parse(format!("spreadsheet: {e}")))?;

    let sheet_name = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| CoreError::parse("spreadsheet has no sheets"))?;
    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| CoreError::parse(format!("sheet {sheet_name}: {e}")))?;

    let mut rows = range.rows();
    let header_row = rows
        .next()
        .ok_or_else(|| CoreError::parse("spreadsheet sheet is empty"))?;
    let columns: Vec<Option<Field>> = header_row
        .iter()
        .map(|cell| match cell {
            Data::String(s) => resolve_field(s),
            _ => None,
        })
        .collect();

    let mut parsed = ParsedFile::default();
    for (index, row) in rows.enumerate() {
        let mut builder = RecordBuilder::default();
        let mut any_value = false;
        for (column, cell) in columns.iter().zip(row.iter()) {
            let Some(field) = column else { continue };
            let raw = match cell_value(cell) {
                Some(v) => v,
                None => RawValue::Null,
            };
            if !matches!(raw, RawValue::Null) {
                any_value = true;
            }
            builder.set(*field, raw);
        }
        if !any_value {
            continue; // trailing blank rows
        }
        match builder.build(index) {
            Ok(record) => parsed.records.push(record),
            Err(e) if mode == ParseMode::Lenient => {
                warn!(index, error = %e, "skipping malformed spreadsheet record");
                parsed.skipped.push(index);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(parsed)
}

fn cell_value(cell: &Data) -> Option<RawValue> {
    match cell {
        Data::Empty => None,
        Data::String(s) => {
            if s.trim().is_empty() {
                None
            } else {
                Some(RawValue::Str(s.clone()))
            }
        }
        Data::Float(f) => Decimal::from_str(&format!("{f}")).ok().map(RawValue::Num),
        Data::Int(i) => Some(RawValue::Num(Decimal::from(*i))),
        Data::Bool(b) => Some(RawValue::Str(b.to_string())),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Some(RawValue::Str(s.clone())),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| RawValue::Str(d.date().format("%Y-%m-%d").to_string())),
        Data::Error(_) => None,
    }
}
