use std::collections::BTreeMap;

use dtx_core::{DataPath, DatastoreScope, Value};

pub(crate) type StoreKey = (DatastoreScope, DataPath);

/// Committed contents of one device.
pub(crate) type Store = BTreeMap<StoreKey, Value>;

/// Merge `patch` into `target`: objects merge key-by-key, recursively;
/// anything else replaces.
pub fn merge_value(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(patch)) => {
            for (key, value) in patch {
                match existing.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        existing.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// An edit staged by a transaction and applied on submit.
#[derive(Debug, Clone)]
pub(crate) enum StagedOp {
    Put {
        scope: DatastoreScope,
        path: DataPath,
        value: Value,
    },
    Merge {
        scope: DatastoreScope,
        path: DataPath,
        value: Value,
    },
    Delete {
        scope: DatastoreScope,
        path: DataPath,
    },
}

impl StagedOp {
    pub(crate) fn targets(&self, scope: DatastoreScope, path: &DataPath) -> bool {
        let (op_scope, op_path) = match self {
            StagedOp::Put { scope, path, .. }
            | StagedOp::Merge { scope, path, .. }
            | StagedOp::Delete { scope, path } => (scope, path),
        };
        *op_scope == scope && op_path == path
    }

    /// Apply this op to the current value of its own path.
    pub(crate) fn apply_to(&self, current: &mut Option<Value>) {
        match self {
            StagedOp::Put { value, .. } => *current = Some(value.clone()),
            StagedOp::Merge { value, .. } => match current {
                Some(existing) => merge_value(existing, value.clone()),
                None => *current = Some(value.clone()),
            },
            StagedOp::Delete { .. } => *current = None,
        }
    }

    pub(crate) fn apply(self, store: &mut Store) {
        match self {
            StagedOp::Put { scope, path, value } => {
                store.insert((scope, path), value);
            }
            StagedOp::Merge { scope, path, value } => match store.get_mut(&(scope, path.clone())) {
                Some(existing) => merge_value(existing, value),
                None => {
                    store.insert((scope, path), value);
                }
            },
            StagedOp::Delete { scope, path } => {
                store.remove(&(scope, path));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_objects_recursively() {
        let mut target = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        merge_value(&mut target, json!({"b": 2, "nested": {"y": 3}}));
        assert_eq!(target, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
    }

    #[test]
    fn test_merge_scalar_replaces() {
        let mut target = json!({"a": 1});
        merge_value(&mut target, json!(7));
        assert_eq!(target, json!(7));
    }

    #[test]
    fn test_staged_ops_apply_in_order() {
        let path = DataPath::new("/p");
        let scope = DatastoreScope::Configuration;
        let mut store = Store::new();

        StagedOp::Merge { scope, path: path.clone(), value: json!({"x": 1}) }.apply(&mut store);
        StagedOp::Merge { scope, path: path.clone(), value: json!({"y": 2}) }.apply(&mut store);
        assert_eq!(store.get(&(scope, path.clone())), Some(&json!({"x": 1, "y": 2})));

        StagedOp::Delete { scope, path: path.clone() }.apply(&mut store);
        assert!(store.is_empty());
    }
}
