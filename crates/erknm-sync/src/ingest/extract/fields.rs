//! Field extraction for a single record element
//!
//! The streaming scanner hands over the `(local name, text)` pairs of every
//! descendant of a record element, in document order. This module turns
//! them into the record key, the record date and the JSON payload using a
//! fixed, declarative candidate table.

use chrono::NaiveDate;
use serde_json::{Map, Value};

/// Longest payload value kept verbatim, in characters
pub const MAX_VALUE_CHARS: usize = 500;

/// Tag names tried, in order, for the record key
pub const KEY_CANDIDATES: &[&str] = &["GUID", "guid", "Id"];

/// Tag names tried, in order, for the record date
pub const DATE_CANDIDATES: &[&str] = &["Date", "date"];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y"];

/// One payload key and the tag names that can fill it
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub key: &'static str,
    pub candidates: &'static [&'static str],
}

const fn rule(key: &'static str, candidates: &'static [&'static str]) -> FieldRule {
    FieldRule { key, candidates }
}

pub const FIELD_TABLE: &[FieldRule] = &[
    rule("number", &["Number", "number"]),
    rule("num", &["Num", "num"]),
    rule("name", &["Name", "name"]),
    rule("title", &["Title", "title"]),
    rule("status", &["Status", "status"]),
    rule("state", &["State", "state"]),
    rule("type", &["Type", "type"]),
    rule("kind", &["Kind", "kind"]),
    rule("region", &["Region", "region"]),
    rule("subject", &["Subject", "subject"]),
    rule("organization", &["Organization", "organization"]),
    rule("org", &["Org", "org"]),
    rule("inn", &["INN", "inn"]),
    rule("ogrn", &["OGRN", "ogrn"]),
    rule("kpp", &["KPP", "kpp"]),
    rule("startDate", &["StartDate", "startDate"]),
    rule("endDate", &["EndDate", "endDate"]),
    rule("address", &["Address", "address"]),
    rule("location", &["Location", "location"]),
    rule("inspector", &["Inspector", "inspector"]),
    rule("executor", &["Executor", "executor"]),
    rule("result", &["Result", "result"]),
    rule("conclusion", &["Conclusion", "conclusion"]),
    rule("violations", &["Violations", "violations"]),
    rule("violationsCount", &["ViolationsCount"]),
    rule("actNumber", &["ActNumber", "actNumber"]),
    rule("orderNumber", &["OrderNumber", "orderNumber"]),
];

/// What the extractor knows about one record
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFields {
    pub key: Option<String>,
    pub date: Option<NaiveDate>,
    pub payload: Map<String, Value>,
}

/// Text of the first descendant named `name` in document order, if that
/// text is non-empty after trimming.
fn first_text<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(tag, _)| tag == name)
        .map(|(_, text)| text.trim())
        .filter(|text| !text.is_empty())
}

/// First of `candidates` that yields text
fn lookup<'a>(pairs: &'a [(String, String)], candidates: &[&str]) -> Option<&'a str> {
    candidates.iter().find_map(|name| first_text(pairs, name))
}

/// Parse the leading ten characters as an ISO or Russian-style date.
pub fn parse_record_date(raw: &str) -> Option<NaiveDate> {
    let head: String = raw.trim().chars().take(10).collect();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&head, format).ok())
}

fn truncate(value: &str) -> String {
    if value.chars().count() <= MAX_VALUE_CHARS {
        return value.to_string();
    }
    let mut cut: String = value.chars().take(MAX_VALUE_CHARS).collect();
    cut.push_str("...");
    cut
}

pub fn extract_fields(pairs: &[(String, String)]) -> RecordFields {
    let mut fields = RecordFields::default();

    if let Some(key) = lookup(pairs, KEY_CANDIDATES) {
        fields.key = Some(key.to_string());
        fields
            .payload
            .insert("guid".to_string(), Value::String(key.to_string()));
    }

    if let Some(raw) = lookup(pairs, DATE_CANDIDATES) {
        if let Some(date) = parse_record_date(raw) {
            fields.date = Some(date);
            fields
                .payload
                .insert("date".to_string(), Value::String(raw.to_string()));
        }
    }

    for rule in FIELD_TABLE {
        if let Some(value) = lookup(pairs, rule.candidates) {
            fields
                .payload
                .insert(rule.key.to_string(), Value::String(truncate(value)));
        }
    }

    fields
}
