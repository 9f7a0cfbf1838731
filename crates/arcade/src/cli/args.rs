//! Parsing of `name=value` field arguments.

use anyhow::{bail, Result};
use serde_json::Value;

/// Split `name=value` at the first `=`.
pub fn split_assignment(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name, value)),
        _ => bail!("Expected NAME=VALUE, got '{raw}'"),
    }
}

/// Parse one field argument.
///
/// The value is taken as JSON when it parses (`count=3`, `meta={"a":1}`) and
/// as a plain string otherwise (`name=north field`).
pub fn parse_field(raw: &str) -> Result<(String, Value)> {
    let (name, value) = split_assignment(raw)?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::from(value));
    Ok((name.to_string(), value))
}

pub fn parse_fields(raw: &[String]) -> Result<Vec<(String, Value)>> {
    raw.iter().map(|r| parse_field(r)).collect()
}
