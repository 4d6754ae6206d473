use std::collections::HashMap;

use serde_yaml::{Mapping, Value};

use crate::OrderingPolicy;

/// String form of a key used for matching and lexicographic ordering.
fn key_text(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Reorders `metadata` according to `policy`.
///
/// Known keys follow `policy.ordered_keys`; all other keys are sorted
/// lexicographically and placed before or after them. Every input key
/// appears exactly once in the output.
pub fn sort_properties(metadata: &Mapping, policy: &OrderingPolicy) -> Mapping {
    let rank: HashMap<&str, usize> = policy
        .ordered_keys
        .iter()
        .enumerate()
        .map(|(i, k)| (k.as_str(), i))
        .collect();

    let mut known: Vec<(usize, &Value, &Value)> = Vec::new();
    let mut unknown: Vec<(String, &Value, &Value)> = Vec::new();
    for (k, v) in metadata {
        let text = key_text(k);
        match rank.get(text.as_str()) {
            Some(&r) => known.push((r, k, v)),
            None => unknown.push((text, k, v)),
        }
    }
    known.sort_by_key(|(r, _, _)| *r);
    unknown.sort_by(|a, b| a.0.cmp(&b.0));

    let known = known.into_iter().map(|(_, k, v)| (k, v));
    let unknown = unknown.into_iter().map(|(_, k, v)| (k, v));

    let mut out = Mapping::with_capacity(metadata.len());
    if policy.unknown_first {
        for (k, v) in unknown.chain(known) {
            out.insert(k.clone(), v.clone());
        }
    } else {
        for (k, v) in known.chain(unknown) {
            out.insert(k.clone(), v.clone());
        }
    }
    out
}

/// True when `metadata` is already in policy order.
pub fn is_sorted(metadata: &Mapping, policy: &OrderingPolicy) -> bool {
    let sorted = sort_properties(metadata, policy);
    metadata.keys().eq(sorted.keys())
}
