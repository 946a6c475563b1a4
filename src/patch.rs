use serde_json::{Map, Value};

/// Compute the RFC 7386 JSON merge patch that turns `base` into `target`.
///
/// Fields present in `base` but absent from `target` become explicit nulls,
/// so that a merge patch built from a serde model with skipped `None` fields
/// still removes data server-side. Arrays are replaced wholesale, which is
/// what keeps `status.pods` a pure function of the latest observation.
pub fn merge_patch(base: &Value, target: &Value) -> Value {
    match (base, target) {
        (Value::Object(base_map), Value::Object(target_map)) => {
            let mut patch = Map::new();
            for (key, target_value) in target_map {
                match base_map.get(key) {
                    Some(base_value) if base_value == target_value => {}
                    Some(base_value) => {
                        patch.insert(key.clone(), merge_patch(base_value, target_value));
                    }
                    None => {
                        patch.insert(key.clone(), target_value.clone());
                    }
                }
            }
            for key in base_map.keys() {
                if !target_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => target.clone(),
    }
}

/// True when the patch would not change anything.
pub fn is_empty(patch: &Value) -> bool {
    matches!(patch, Value::Object(map) if map.is_empty())
}
