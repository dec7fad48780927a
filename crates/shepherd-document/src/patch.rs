use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DocumentError;

/// Apply an RFC 7386 merge patch to `target` in place. Objects merge
/// recursively, `null` removes the key, everything else replaces.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(existing) = target {
                for (key, value) in entries {
                    if value.is_null() {
                        existing.remove(key);
                    } else {
                        merge_patch(
                            existing.entry(key.clone()).or_insert(Value::Null),
                            value,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Replace,
    Remove,
}

/// A single RFC 6902 operation. The store only needs the object-path subset
/// the engine emits (finalizer list replacement), plus `add`/`remove` for
/// completeness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    pub fn replace(path: &str, value: Value) -> Self {
        PatchOp {
            op: PatchOpKind::Replace,
            path: path.to_string(),
            value: Some(value),
        }
    }
}

pub fn apply_json_patch(target: &mut Value, ops: &[PatchOp]) -> Result<(), DocumentError> {
    for op in ops {
        apply_op(target, op)?;
    }
    Ok(())
}

fn apply_op(target: &mut Value, op: &PatchOp) -> Result<(), DocumentError> {
    let tokens = parse_pointer(&op.path)?;
    let (last, parents) = tokens
        .split_last()
        .ok_or_else(|| DocumentError::InvalidPatchPath(op.path.clone()))?;

    let mut current = target;
    for token in parents {
        current = current
            .get_mut(token.as_str())
            .ok_or_else(|| DocumentError::MissingPatchTarget(op.path.clone()))?;
    }
    let map = current
        .as_object_mut()
        .ok_or_else(|| DocumentError::MissingPatchTarget(op.path.clone()))?;

    match op.op {
        PatchOpKind::Add | PatchOpKind::Replace => {
            let value = op
                .value
                .clone()
                .ok_or_else(|| DocumentError::InvalidPatchPath(op.path.clone()))?;
            map.insert(last.clone(), value);
        }
        PatchOpKind::Remove => {
            map.remove(last.as_str());
        }
    }
    Ok(())
}

fn parse_pointer(path: &str) -> Result<Vec<String>, DocumentError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| DocumentError::InvalidPatchPath(path.to_string()))?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

/// Paths (JSON-pointer style) at which `declared` differs from `observed`,
/// restricted to fields the declared side actually sets. Used to log what an
/// update call is about to change.
pub fn diff_paths(declared: &Value, observed: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    collect_diffs("", declared, observed, &mut paths);
    paths
}

fn collect_diffs(prefix: &str, declared: &Value, observed: &Value, out: &mut Vec<String>) {
    match (declared, observed) {
        (Value::Object(declared_map), Value::Object(observed_map)) => {
            for (key, declared_value) in declared_map {
                let path = format!("{prefix}/{key}");
                match observed_map.get(key) {
                    Some(observed_value) => {
                        collect_diffs(&path, declared_value, observed_value, out)
                    }
                    None => out.push(path),
                }
            }
        }
        _ => {
            if declared != observed {
                out.push(if prefix.is_empty() {
                    "/".to_string()
                } else {
                    prefix.to_string()
                });
            }
        }
    }
}
