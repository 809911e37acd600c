//! Loading transaction records handed over by the extraction pipeline.
//!
//! Values that do not parse are kept as missing so the record surfaces as
//! `missing_required_field` instead of failing the run. Only structurally
//! broken input (bad CSV framing, invalid JSON) is an error.

use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::{Map, Value};

use crate::error::ReconError;
use crate::model::{Side, TransactionRecord};

pub const CSV_COLUMNS: [&str; 11] = [
    "id",
    "entity_id",
    "counterparty_id",
    "account_code",
    "amount",
    "currency",
    "date",
    "narration",
    "source_document_id",
    "side",
    "voucher_type",
];

/// Parse CSV with a header row. Columns are matched by name; unknown columns
/// are ignored and absent ones read as missing.
pub fn load_csv(input: &str) -> Result<Vec<TransactionRecord>, ReconError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(input.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ReconError::Input(format!("CSV header: {e}")))?
        .clone();
    let columns: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.trim_start_matches('\u{feff}'), i))
        .collect();
    if !columns.contains_key("id") {
        return Err(ReconError::Input("CSV header has no 'id' column".into()));
    }

    let mut records = Vec::new();
    for (row_idx, result) in reader.records().enumerate() {
        let row = result
            .map_err(|e| ReconError::Input(format!("CSV parse error at row {}: {e}", row_idx + 1)))?;
        let field = |name: &str| -> Option<String> {
            columns
                .get(name)
                .and_then(|&i| row.get(i))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        records.push(TransactionRecord {
            id: field("id"),
            entity_id: field("entity_id"),
            counterparty_id: field("counterparty_id"),
            account_code: field("account_code"),
            amount: field("amount").and_then(|v| parse_amount(&v)),
            currency: field("currency"),
            date: field("date").and_then(|v| parse_date(&v)),
            narration: field("narration"),
            source_document_id: field("source_document_id"),
            side: field("side").and_then(|v| Side::parse(&v)),
            voucher_type: field("voucher_type"),
        });
    }

    log::debug!("loaded {} records from CSV", records.len());
    Ok(records)
}

/// Parse a JSON array of loosely shaped objects. Keys may be snake_case or
/// camelCase; amounts may be numbers or numeric strings.
pub fn load_json(input: &str) -> Result<Vec<TransactionRecord>, ReconError> {
    let value: Value =
        serde_json::from_str(input).map_err(|e| ReconError::Input(format!("JSON: {e}")))?;
    let Value::Array(items) = value else {
        return Err(ReconError::Input("JSON input must be an array of records".into()));
    };

    let records = items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(obj) => Ok(record_from_object(obj)),
            other => Err(ReconError::Input(format!(
                "JSON record {i}: expected an object, got {}",
                kind(other)
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    log::debug!("loaded {} records from JSON", records.len());
    Ok(records)
}

fn record_from_object(obj: &Map<String, Value>) -> TransactionRecord {
    let get = |snake: &str, camel: &str| obj.get(snake).or_else(|| obj.get(camel));
    let text = |snake: &str, camel: &str| get(snake, camel).and_then(value_text);

    TransactionRecord {
        id: text("id", "id"),
        entity_id: text("entity_id", "entityId"),
        counterparty_id: text("counterparty_id", "counterpartyId"),
        account_code: text("account_code", "accountCode"),
        amount: get("amount", "amount").and_then(value_amount),
        currency: text("currency", "currency"),
        date: text("date", "date").and_then(|v| parse_date(&v)),
        narration: text("narration", "narration"),
        source_document_id: text("source_document_id", "sourceDocumentId"),
        side: text("side", "side").and_then(|v| Side::parse(&v)),
        voucher_type: text("voucher_type", "voucherType"),
    }
}

/// Strings as-is, numbers in their JSON form (account codes are often
/// numeric); everything else is missing.
fn value_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn value_amount(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => parse_amount(s),
        _ => None,
    }
}

/// Integer minor units; `_` and `,` group separators are accepted.
pub fn parse_amount(s: &str) -> Option<i64> {
    let cleaned: String = s.trim().chars().filter(|c| *c != ',' && *c != '_').collect();
    cleaned.parse().ok()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
