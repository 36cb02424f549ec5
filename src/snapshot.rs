use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

/// Per-model token totals as of snapshot time. Absolute values, never deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelTokens {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// An absolute, point-in-time cumulative usage total read from the snapshot
/// file. Immutable once constructed; a fresh value is built on every
/// successful read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub session_count: u64,
    pub message_count: u64,
    pub tool_calls_by_day: BTreeMap<String, u64>,
    pub tokens_by_model: BTreeMap<String, ModelTokens>,
    pub cost_by_model: BTreeMap<String, f64>,
}

impl UsageSnapshot {
    pub fn tool_call_count(&self) -> u64 {
        self.tool_calls_by_day.values().sum()
    }
}

/// Reads the snapshot file. A file that is missing, unreadable, or not JSON
/// yields `None`; the caller skips reconciliation for that cycle. Individual
/// fields with an unexpected shape default to zero instead of failing the
/// whole read.
pub fn read_snapshot(path: &Path) -> Option<UsageSnapshot> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "usage snapshot unavailable");
            return None;
        }
    };

    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "usage snapshot is not valid JSON");
            return None;
        }
    };

    Some(snapshot_from_value(&parsed))
}

fn snapshot_from_value(value: &Value) -> UsageSnapshot {
    UsageSnapshot {
        session_count: uint_at(value, &["sessionCount"]).unwrap_or(0),
        message_count: uint_at(value, &["messageCount"]).unwrap_or(0),
        tool_calls_by_day: uint_map_at(value, "toolCallsByDay"),
        tokens_by_model: tokens_map_at(value, "tokensByModel"),
        cost_by_model: cost_map_at(value, "costByModel"),
    }
}

fn tokens_map_at(value: &Value, key: &str) -> BTreeMap<String, ModelTokens> {
    let mut out = BTreeMap::new();
    let Some(map) = value.get(key).and_then(Value::as_object) else {
        return out;
    };
    for (model, entry) in map {
        if model.trim().is_empty() {
            continue;
        }
        out.insert(
            model.clone(),
            ModelTokens {
                input: uint_at(entry, &["input"]).unwrap_or(0),
                output: uint_at(entry, &["output"]).unwrap_or(0),
                cache_read: uint_at(entry, &["cacheRead"]).unwrap_or(0),
                cache_write: uint_at(entry, &["cacheWrite"]).unwrap_or(0),
            },
        );
    }
    out
}

fn cost_map_at(value: &Value, key: &str) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let Some(map) = value.get(key).and_then(Value::as_object) else {
        return out;
    };
    for (model, entry) in map {
        if model.trim().is_empty() {
            continue;
        }
        let cost = entry.as_f64().filter(|v| v.is_finite() && *v >= 0.0);
        out.insert(model.clone(), cost.unwrap_or(0.0));
    }
    out
}

fn uint_map_at(value: &Value, key: &str) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    let Some(map) = value.get(key).and_then(Value::as_object) else {
        return out;
    };
    for (day, entry) in map {
        out.insert(day.clone(), entry.as_u64().unwrap_or(0));
    }
    out
}

fn uint_at(value: &Value, path: &[&str]) -> Option<u64> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor
        .as_u64()
        .or_else(|| cursor.as_i64().and_then(|n| (n >= 0).then_some(n as u64)))
}
