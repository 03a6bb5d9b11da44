//! Metadata merge rules for node upserts.

use serde_json::{Map, Number, Value};

use braid_core::tokens::ACCUMULATING_KEYS;

/// Identity-like keys that must never be written through metadata.
pub const DENYLIST: &[&str] = &["id", "sessionId", "parentId", "path"];

pub fn strip_denylisted(metadata: &mut Map<String, Value>) {
    for key in DENYLIST {
        metadata.remove(*key);
    }
}

/// Merge `incoming` over `existing`. Accumulating counters are summed,
/// nested objects merge recursively, everything else is last-write-wins.
pub fn merge_metadata(
    existing: Map<String, Value>,
    mut incoming: Map<String, Value>,
) -> Map<String, Value> {
    strip_denylisted(&mut incoming);
    merge_nested(existing, incoming)
}

fn merge_nested(
    mut existing: Map<String, Value>,
    incoming: Map<String, Value>,
) -> Map<String, Value> {
    for (key, value) in incoming {
        let merged = match (existing.remove(&key), value) {
            (Some(Value::Number(a)), Value::Number(b))
                if ACCUMULATING_KEYS.contains(&key.as_str()) =>
            {
                Value::Number(sum(&a, &b))
            }
            (Some(Value::Object(a)), Value::Object(b)) => Value::Object(merge_nested(a, b)),
            (_, value) => value,
        };
        existing.insert(key, merged);
    }
    existing
}

fn sum(a: &Number, b: &Number) -> Number {
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return Number::from(x.saturating_add(y));
    }
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return Number::from(x.saturating_add(y));
    }
    let total = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(total).unwrap_or_else(|| b.clone())
}
