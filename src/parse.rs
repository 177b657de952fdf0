//! Conversions for the spreadsheet conventions: unit suffixes, percentages,
//! two date styles and free-text enum values.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;

/// Lowercases and replaces spaces with underscores, the normalization used
/// both for CSV headers and for enum-like cell values.
pub fn snake_case(value: &str) -> String {
    value.trim().to_lowercase().replace(' ', "_")
}

/// Parses a number that may carry thousands separators or a trailing `%`.
/// A percent sign turns the value into a fraction.
pub fn parse_float(value: &str) -> Result<f64, String> {
    let trimmed = value.trim();
    let cleaned = trimmed.replace(',', "");
    let number = cleaned.strip_suffix('%').unwrap_or(&cleaned).trim();
    let parsed: f64 = number
        .parse()
        .map_err(|err: std::num::ParseFloatError| err.to_string())?;
    if trimmed.contains('%') {
        Ok(parsed / 100.0)
    } else {
        Ok(parsed)
    }
}

/// Parses a percentage column whose header already says `(%)`, so the cell
/// is a percentage with or without the sign.
pub fn parse_percentage(value: &str) -> Result<f64, String> {
    let cleaned = value.trim().replace(',', "");
    let number = cleaned.strip_suffix('%').unwrap_or(&cleaned).trim();
    number
        .parse::<f64>()
        .map(|parsed| parsed / 100.0)
        .map_err(|err| err.to_string())
}

/// Integers are frequently exported as `12.0`.
pub fn parse_int(value: &str) -> Result<i64, String> {
    let parsed = parse_float(value)?;
    if parsed.fract() != 0.0 {
        return Err(format!("{value} is not a whole number"));
    }
    // `i64::MAX as f64` rounds up to 2^63, one past the largest i64.
    if parsed < i64::MIN as f64 || parsed >= i64::MAX as f64 {
        return Err(format!("{value} is out of range"));
    }
    Ok(parsed as i64)
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_uppercase().as_str() {
        "TRUE" => Some(true),
        "FALSE" => Some(false),
        _ => None,
    }
}

/// Lab dates carry no time. They are pinned to 9am on the US east coast,
/// stored as 13:00 UTC.
pub fn at_nine_eastern(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_hms_opt(13, 0, 0).unwrap_or_default())
}

/// `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map(at_nine_eastern)
        .map_err(|err| err.to_string())
}

/// `M/D/YYYY`, possibly followed by a range (`-…`) or a second date (`&…`).
/// Only the first date counts.
pub fn parse_loose_date(value: &str) -> Result<DateTime<Utc>, String> {
    let first = value
        .trim()
        .split('-')
        .next()
        .unwrap_or_default()
        .split('&')
        .next()
        .unwrap_or_default()
        .trim();
    let parts = first.split('/').map(str::trim).collect::<Vec<_>>();
    let [month, day, year] = parts.as_slice() else {
        return Err(format!("expected month/day/year, got {first:?}"));
    };
    let month: u32 = month.parse().map_err(|_| format!("bad month {month:?}"))?;
    let day: u32 = day.parse().map_err(|_| format!("bad day {day:?}"))?;
    let year: i32 = year.parse().map_err(|_| format!("bad year {year:?}"))?;
    NaiveDate::from_ymd_opt(year, month, day)
        .map(at_nine_eastern)
        .ok_or_else(|| format!("{first} is not a calendar date"))
}

/// Reads a free-text cell as one of the snake_case tags of `T`.
pub fn from_tag<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(snake_case(value)))
        .map_err(|err| err.to_string())
}
