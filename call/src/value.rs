//! Conversion between command-line text, JSON and wire values

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value as Json;
use tether::{Bytes, Value};

/// Parse one command-line argument
pub fn parse_arg(arg: &str) -> Result<Value> {
    if let Some(path) = arg.strip_prefix('@') {
        let data = std::fs::read(Path::new(path))
            .with_context(|| format!("failed to read argument file {path}"))?;
        return Ok(Value::Bytes(Bytes::from(data)));
    }
    match serde_json::from_str::<Json>(arg) {
        Ok(json) => from_json(json),
        Err(_) => Ok(Value::Str(arg.to_string())),
    }
}

fn from_json(json: Json) -> Result<Value> {
    Ok(match json {
        Json::Null => Value::Unit,
        Json::Bool(b) => Value::Bool(b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => Value::Float(n.as_f64().context("number out of range")?),
        },
        Json::String(s) => Value::Str(s),
        record @ (Json::Array(_) | Json::Object(_)) => {
            Value::Record(Bytes::from(rmp_serde::to_vec_named(&record)?))
        }
    })
}

/// Render a result for printing
pub fn to_json(value: Value) -> Result<Json> {
    Ok(match value {
        Value::Unit => Json::Null,
        Value::Bool(b) => Json::Bool(b),
        Value::Int(i) => Json::from(i),
        Value::Float(f) => Json::from(f),
        Value::Str(s) => Json::String(s),
        Value::Record(encoded) => {
            rmp_serde::from_slice(&encoded).context("failed to decode record result")?
        }
        Value::Bytes(bytes) => Json::Array(bytes.iter().map(|&b| Json::from(b)).collect()),
    })
}
