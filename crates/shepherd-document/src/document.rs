use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::conditions::Condition;
use crate::error::DocumentError;

/// A schemaless record held in the control-plane store.
///
/// The tree is an arbitrary JSON object. Only `metadata` and
/// `status.conditions` have a fixed shape; everything under
/// `spec.<version>` and `status.<version>` is opaque to the engine and is
/// read/written by per-kind handlers through the nested-field accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Value,
}

impl Document {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let mut doc = Document {
            root: Value::Object(Map::new()),
        };
        doc.set_nested(&["apiVersion"], Value::String(api_version.to_string()));
        doc.set_nested(&["kind"], Value::String(kind.to_string()));
        doc.set_nested(&["metadata", "namespace"], Value::String(namespace.to_string()));
        doc.set_nested(&["metadata", "name"], Value::String(name.to_string()));
        doc
    }

    pub fn from_value(root: Value) -> Result<Self, DocumentError> {
        if !root.is_object() {
            return Err(DocumentError::NotAnObject);
        }
        Ok(Document { root })
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn as_value_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    // ── Nested-field access ──────────────────────────────────────────────────

    pub fn get_nested(&self, path: &[&str]) -> Option<&Value> {
        let mut current = &self.root;
        for segment in path {
            current = current.as_object()?.get(*segment)?;
        }
        Some(current)
    }

    /// Set a value at a path of object keys, creating intermediate objects.
    /// Non-object intermediates are overwritten.
    pub fn set_nested(&mut self, path: &[&str], value: Value) {
        let (last, parents) = match path.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut current = &mut self.root;
        for segment in parents {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            current = match current {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                _ => return,
            };
        }
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        if let Value::Object(map) = current {
            map.insert(last.to_string(), value);
        }
    }

    /// Deserialize the subtree at `path` into `T`. An absent subtree yields
    /// `T::default()`, mirroring how handlers treat unset spec regions.
    pub fn nested_as<T>(&self, path: &[&str]) -> Result<T, DocumentError>
    where
        T: DeserializeOwned + Default,
    {
        match self.get_nested(path) {
            None => Ok(T::default()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|source| DocumentError::Conversion {
                    path: path.join("."),
                    source,
                })
            }
        }
    }

    /// Serialize `value` and place it at `path`.
    pub fn set_nested_as<T: Serialize>(
        &mut self,
        path: &[&str],
        value: &T,
    ) -> Result<(), DocumentError> {
        let value = serde_json::to_value(value).map_err(|source| DocumentError::Conversion {
            path: path.join("."),
            source,
        })?;
        self.set_nested(path, value);
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    fn metadata_str(&self, field: &str) -> &str {
        self.get_nested(&["metadata", field])
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn api_version(&self) -> &str {
        self.get_nested(&["apiVersion"])
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.get_nested(&["kind"])
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.metadata_str("name")
    }

    pub fn namespace(&self) -> &str {
        self.metadata_str("namespace")
    }

    pub fn uid(&self) -> &str {
        self.metadata_str("uid")
    }

    pub fn set_uid(&mut self, uid: &str) {
        self.set_nested(&["metadata", "uid"], Value::String(uid.to_string()));
    }

    pub fn generation(&self) -> i64 {
        self.get_nested(&["metadata", "generation"])
            .and_then(Value::as_i64)
            .unwrap_or_default()
    }

    pub fn set_generation(&mut self, generation: i64) {
        self.set_nested(&["metadata", "generation"], Value::from(generation));
    }

    pub fn deletion_timestamp(&self) -> Option<DateTime<Utc>> {
        self.get_nested(&["metadata", "deletionTimestamp"])
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn set_deletion_timestamp(&mut self, at: DateTime<Utc>) {
        self.set_nested(
            &["metadata", "deletionTimestamp"],
            Value::String(at.to_rfc3339()),
        );
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        match self.get_nested(&["metadata", "annotations"]) {
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.get_nested(&["metadata", "annotations", key])
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set_nested(
            &["metadata", "annotations", key],
            Value::String(value.to_string()),
        );
    }

    // ── Finalizers ───────────────────────────────────────────────────────────

    pub fn finalizers(&self) -> Vec<String> {
        match self.get_nested(&["metadata", "finalizers"]) {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn has_finalizer(&self, name: &str) -> bool {
        self.finalizers().iter().any(|f| f == name)
    }

    pub fn add_finalizer(&mut self, name: &str) {
        let mut finalizers = self.finalizers();
        if !finalizers.iter().any(|f| f == name) {
            finalizers.push(name.to_string());
        }
        self.set_finalizers(finalizers);
    }

    pub fn remove_finalizer(&mut self, name: &str) {
        let finalizers: Vec<String> = self
            .finalizers()
            .into_iter()
            .filter(|f| f != name)
            .collect();
        self.set_finalizers(finalizers);
    }

    pub fn set_finalizers(&mut self, finalizers: Vec<String>) {
        self.set_nested(
            &["metadata", "finalizers"],
            Value::Array(finalizers.into_iter().map(Value::String).collect()),
        );
    }

    // ── Conditions ───────────────────────────────────────────────────────────

    pub fn conditions(&self) -> Result<Vec<Condition>, DocumentError> {
        match self.get_nested(&["status", "conditions"]) {
            None => Ok(Vec::new()),
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|source| DocumentError::Conversion {
                    path: "status.conditions".to_string(),
                    source,
                })
            }
        }
    }

    pub fn set_conditions(&mut self, conditions: &[Condition]) -> Result<(), DocumentError> {
        self.set_nested_as(&["status", "conditions"], &conditions)
    }
}
