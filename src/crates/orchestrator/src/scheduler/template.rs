//! `{{step_id.field}}` references in step inputs
//!
//! A string that is exactly one reference is replaced by the referenced JSON
//! value; references embedded in longer strings are interpolated as text.
//! `field` is `output` for the whole output, or a dotted path into it
//! (`summary`, `output.summary` and `items.0` are all accepted). Absent
//! values (skipped step, missing field) resolve to the empty string.

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use crate::model::Task;

/// One reference found in a string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference<'a> {
    pub start: usize,
    pub end: usize,
    pub step_id: &'a str,
    pub field: &'a str,
}

fn is_segment(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Scan a string for well-formed references, left to right
pub fn scan(s: &str) -> Vec<Reference<'_>> {
    let mut refs = Vec::new();
    let mut pos = 0;

    while let Some(offset) = s[pos..].find("{{") {
        let start = pos + offset;
        let Some(close) = s[start + 2..].find("}}") else {
            break;
        };
        let end = start + 2 + close + 2;
        let inner = s[start + 2..end - 2].trim();

        if let Some((step_id, field)) = inner.split_once('.') {
            if is_segment(step_id) && field.split('.').all(is_segment) {
                refs.push(Reference {
                    start,
                    end,
                    step_id,
                    field,
                });
                pos = end;
                continue;
            }
        }
        pos = start + 2;
    }

    refs
}

/// Step ids referenced anywhere in a value
pub fn referenced_steps(value: &Value) -> BTreeSet<String> {
    let mut ids = BTreeSet::new();
    collect(value, &mut ids);
    ids
}

fn collect(value: &Value, ids: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            ids.extend(scan(s).into_iter().map(|r| r.step_id.to_string()));
        }
        Value::Array(items) => items.iter().for_each(|v| collect(v, ids)),
        Value::Object(map) => map.values().for_each(|v| collect(v, ids)),
        _ => {}
    }
}

fn lookup(task: &Task, step_id: &str, field: &str) -> Option<Value> {
    let output = task.step(step_id)?.output.as_ref()?;
    if field == "output" {
        return Some(output.clone());
    }

    let path = field.strip_prefix("output.").unwrap_or(field);
    let mut current = output;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn as_text(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
    }
}

/// Substitute every reference in `value` using the task's step outputs
pub fn resolve(value: &Value, task: &Task) -> Value {
    match value {
        Value::String(s) => resolve_string(s, task),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve(v, task)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve(v, task)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_string(s: &str, task: &Task) -> Value {
    let refs = scan(s);
    if refs.is_empty() {
        return Value::String(s.to_string());
    }

    if let [only] = refs.as_slice() {
        if s[..only.start].trim().is_empty() && s[only.end..].trim().is_empty() {
            return match lookup(task, only.step_id, only.field) {
                Some(Value::Null) | None => Value::String(String::new()),
                Some(value) => value,
            };
        }
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for r in &refs {
        out.push_str(&s[last..r.start]);
        out.push_str(&as_text(lookup(task, r.step_id, r.field)));
        last = r.end;
    }
    out.push_str(&s[last..]);
    Value::String(out)
}

/// Rewrite referenced step ids according to `mapping`; other text is untouched
pub fn rewrite_step_ids(value: &Value, mapping: &HashMap<String, String>) -> Value {
    match value {
        Value::String(s) => Value::String(rewrite_string(s, mapping)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| rewrite_step_ids(v, mapping))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_step_ids(v, mapping)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn rewrite_string(s: &str, mapping: &HashMap<String, String>) -> String {
    let refs = scan(s);
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for r in refs {
        let Some(new_id) = mapping.get(r.step_id) else {
            continue;
        };
        out.push_str(&s[last..r.start]);
        out.push_str("{{");
        out.push_str(new_id);
        out.push('.');
        out.push_str(r.field);
        out.push_str("}}");
        last = r.end;
    }
    out.push_str(&s[last..]);
    out
}
