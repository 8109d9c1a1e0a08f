//! Recursive object merge with per-leaf source attribution (§4.6), and the
//! stable params hash used for caching and the property test in §8.
//!
//! Adapted from the deep-merge-with-path shape used elsewhere for generic
//! JSON tooling in this crate, specialized to the "later layer wins,
//! non-object replaces, object-over-object merges recursively, and
//! replacing an object with a non-object resets its descendant
//! attributions" semantics §4.6 requires.

use super::OverlayLayer;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

/// Merges `patch` into `base` in place, attributing every leaf path that
/// `patch` touches to `layer` in `source`.
pub fn merge_layer(
    base: &mut Value,
    patch: &Value,
    layer: OverlayLayer,
    source: &mut FxHashMap<String, OverlayLayer>,
) {
    merge_at(base, patch, layer, "", source);
}

fn merge_at(
    base: &mut Value,
    patch: &Value,
    layer: OverlayLayer,
    path: &str,
    source: &mut FxHashMap<String, OverlayLayer>,
) {
    match patch {
        Value::Object(patch_obj) => {
            let base_obj = match base {
                Value::Object(obj) => obj,
                _ => {
                    // Non-object (or absent) being replaced by an object: reset
                    // whatever this path used to attribute, then merge into a
                    // fresh map so every leaf below is freshly attributed.
                    remove_source_prefix(source, path);
                    *base = Value::Object(Map::new());
                    match base {
                        Value::Object(obj) => obj,
                        _ => unreachable!(),
                    }
                }
            };
            for (key, patch_value) in patch_obj {
                let child_path = join_path(path, key);
                let existing = base_obj.entry(key.clone()).or_insert(Value::Null);
                merge_at(existing, patch_value, layer, &child_path, source);
            }
        }
        non_object => {
            remove_source_prefix(source, path);
            *base = non_object.clone();
            source.insert(path.to_string(), layer);
        }
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn remove_source_prefix(source: &mut FxHashMap<String, OverlayLayer>, path: &str) {
    if path.is_empty() {
        source.clear();
        return;
    }
    let prefix = format!("{path}.");
    source.retain(|k, _| k != path && !k.starts_with(&prefix));
}

/// Deterministic string form of a JSON value: object keys sorted
/// lexicographically, arrays kept in natural order, numbers rendered via
/// their canonical `Display`. Independent of source key order.
pub fn canonical_string(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", quote(k), canonical_string(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(arr) => {
            let parts: Vec<String> = arr.iter().map(canonical_string).collect();
            format!("[{}]", parts.join(","))
        }
        Value::String(s) => quote(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).expect("string serialization is infallible")
}

/// Stable 64-bit hash of the effective params JSON, independent of key order.
pub fn params_hash(value: &Value) -> u64 {
    crate::fnv::fnv1a_64(canonical_string(value).as_bytes())
}

/// `shadow.sample` (a float in `[0,1]`) to basis points, rounding half away
/// from zero, per §6.
pub fn sample_to_bps(sample: f64) -> u32 {
    let scaled = sample * 10_000.0;
    let rounded = if scaled >= 0.0 {
        (scaled + 0.5).floor()
    } else {
        (scaled - 0.5).ceil()
    };
    rounded.clamp(0.0, 10_000.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn params_hash_is_independent_of_key_order() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(params_hash(&a), params_hash(&b));
    }

    #[test]
    fn object_over_object_merges_recursively() {
        let mut base = json!({"a": 1, "b": {"x": 10}});
        let patch = json!({"b": {"y": 20}, "c": 3});
        let mut source = FxHashMap::default();
        merge_layer(&mut base, &patch, OverlayLayer::Base, &mut source);
        assert_eq!(base, json!({"a": 1, "b": {"x": 10, "y": 20}, "c": 3}));
        assert_eq!(source.get("b.y"), Some(&OverlayLayer::Base));
        assert_eq!(source.get("c"), Some(&OverlayLayer::Base));
    }

    #[test]
    fn non_object_replacing_object_resets_descendant_attribution() {
        let mut base = json!({"a": {"x": 1, "y": 2}});
        let mut source = FxHashMap::default();
        merge_layer(
            &mut base,
            &json!({"a": {"x": 1, "y": 2}}),
            OverlayLayer::Base,
            &mut source,
        );
        assert!(source.contains_key("a.x"));
        assert!(source.contains_key("a.y"));

        merge_layer(&mut base, &json!({"a": 5}), OverlayLayer::Experiment, &mut source);
        assert_eq!(base, json!({"a": 5}));
        assert!(!source.contains_key("a.x"));
        assert!(!source.contains_key("a.y"));
        assert_eq!(source.get("a"), Some(&OverlayLayer::Experiment));
    }

    #[test]
    fn sample_rounds_half_away_from_zero() {
        assert_eq!(sample_to_bps(1.0), 10_000);
        assert_eq!(sample_to_bps(0.0), 0);
        assert_eq!(sample_to_bps(0.12345), 1235);
    }

    proptest! {
        #[test]
        fn merge_is_order_independent_for_disjoint_keys(a in 0i64..1000, b in 0i64..1000) {
            let mut base1 = json!({});
            let mut source1 = FxHashMap::default();
            merge_layer(&mut base1, &json!({"a": a}), OverlayLayer::Base, &mut source1);
            merge_layer(&mut base1, &json!({"b": b}), OverlayLayer::Qos, &mut source1);

            let mut base2 = json!({});
            let mut source2 = FxHashMap::default();
            merge_layer(&mut base2, &json!({"b": b}), OverlayLayer::Qos, &mut source2);
            merge_layer(&mut base2, &json!({"a": a}), OverlayLayer::Base, &mut source2);

            prop_assert_eq!(params_hash(&base1), params_hash(&base2));
        }
    }
}
