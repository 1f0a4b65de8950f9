//! Delta computer
//!
//! Structural comparison between a desired and an observed object, used to
//! decide whether an apply is needed at all. Server-owned metadata is
//! stripped from both sides; keys present only in the observed object are
//! server-owned defaults and never count as drift.

use serde_json::Value;

/// A single difference between desired and observed state
#[derive(Clone, Debug, PartialEq)]
pub struct Difference {
    /// Dotted field path, with `[i]` suffixes for list indexes
    pub path: String,
    /// The desired value at the path
    pub desired: Value,
    /// The observed value at the path (null when absent)
    pub observed: Value,
}

/// Fields the API server owns on every object
const SERVER_MANAGED_METADATA: [&str; 9] = [
    "creationTimestamp",
    "deletionTimestamp",
    "generation",
    "resourceVersion",
    "selfLink",
    "uid",
    "managedFields",
    "ownerReferences",
    "finalizers",
];

/// Compare desired and observed objects structurally.
///
/// Returns one entry per differing field; an empty result means the apply
/// can be skipped.
pub fn compare(desired: &Value, observed: &Value) -> Vec<Difference> {
    let mut desired = desired.clone();
    let mut observed = observed.clone();
    clean_metadata(&mut desired);
    clean_metadata(&mut observed);

    let mut differences = Vec::new();
    walk_compare(&desired, &observed, "", &mut differences);
    differences
}

fn clean_metadata(object: &mut Value) {
    // status is server-populated; never part of the desired shape
    if let Some(obj) = object.as_object_mut() {
        obj.remove("status");
    }

    let Some(metadata) = object.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };

    for key in ["annotations", "labels"] {
        let empty = metadata
            .get(key)
            .and_then(Value::as_object)
            .is_some_and(|m| m.is_empty());
        if empty {
            metadata.remove(key);
        }
    }

    for field in SERVER_MANAGED_METADATA {
        metadata.remove(field);
    }
}

fn walk_compare(desired: &Value, observed: &Value, path: &str, differences: &mut Vec<Difference>) {
    match desired {
        Value::Object(map) => {
            let Some(observed_map) = observed.as_object() else {
                differences.push(Difference {
                    path: path.to_string(),
                    desired: desired.clone(),
                    observed: observed.clone(),
                });
                return;
            };
            for (key, desired_value) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                match observed_map.get(key) {
                    None if !desired_value.is_null() => differences.push(Difference {
                        path: child_path,
                        desired: desired_value.clone(),
                        observed: Value::Null,
                    }),
                    None => {}
                    Some(observed_value) => {
                        walk_compare(desired_value, observed_value, &child_path, differences)
                    }
                }
            }
        }
        Value::Array(items) => {
            let Some(observed_items) = observed.as_array() else {
                differences.push(Difference {
                    path: path.to_string(),
                    desired: desired.clone(),
                    observed: observed.clone(),
                });
                return;
            };
            if items.len() != observed_items.len() {
                differences.push(Difference {
                    path: path.to_string(),
                    desired: desired.clone(),
                    observed: observed.clone(),
                });
                return;
            }
            for (i, (desired_item, observed_item)) in
                items.iter().zip(observed_items).enumerate()
            {
                walk_compare(
                    desired_item,
                    observed_item,
                    &format!("{path}[{i}]"),
                    differences,
                );
            }
        }
        _ => {
            if desired != observed {
                differences.push(Difference {
                    path: path.to_string(),
                    desired: desired.clone(),
                    observed: observed.clone(),
                });
            }
        }
    }
}
