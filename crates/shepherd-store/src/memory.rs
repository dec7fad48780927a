use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use shepherd_document::{apply_json_patch, merge_patch, Document};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::{DocumentStore, Gvk, ObjectRef, Patch, WatchEvent};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Inner {
    documents: HashMap<ObjectRef, Document>,
}

/// In-memory implementation of [`DocumentStore`].
///
/// All data is lost on process exit. Suitable for tests and single-process
/// deployments.
#[derive(Debug, Clone)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        InMemoryStore {
            inner: Arc::new(RwLock::new(Inner::default())),
            events,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit(&self, event: WatchEvent) {
        // Nobody subscribed yet is fine; events are best-effort.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, key: &ObjectRef) -> Result<Document, StoreError> {
        let guard = self.inner.read().await;
        guard
            .documents
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self, gvk: &Gvk) -> Result<Vec<Document>, StoreError> {
        let guard = self.inner.read().await;
        Ok(guard
            .documents
            .iter()
            .filter(|(key, _)| &key.gvk == gvk)
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn create(&self, mut doc: Document) -> Result<Document, StoreError> {
        let key = ObjectRef::from_document(&doc);
        let mut guard = self.inner.write().await;
        if guard.documents.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        doc.set_uid(&Uuid::new_v4().to_string());
        doc.set_generation(1);
        guard.documents.insert(key.clone(), doc.clone());
        drop(guard);
        debug!(key = %key, "document created");
        self.emit(WatchEvent::Created {
            key,
            doc: doc.clone(),
        });
        Ok(doc)
    }

    async fn patch(&self, key: &ObjectRef, patch: Patch) -> Result<Document, StoreError> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .documents
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let old = stored.clone();

        let mut value = old.clone().into_value();
        match patch {
            Patch::Merge(mut payload) => {
                // Status is a subresource; a main-resource patch cannot
                // touch it.
                if let Some(map) = payload.as_object_mut() {
                    map.remove("status");
                }
                merge_patch(&mut value, &payload);
            }
            Patch::Json(ops) => apply_json_patch(&mut value, &ops)?,
        }
        let mut updated = Document::from_value(value)?;

        if updated.get_nested(&["spec"]) != old.get_nested(&["spec"]) {
            updated.set_generation(old.generation() + 1);
        } else {
            updated.set_generation(old.generation());
        }

        self.finish_write(&mut guard, key, old, updated)
    }

    async fn patch_status(&self, key: &ObjectRef, patch: Value) -> Result<Document, StoreError> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .documents
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let old = stored.clone();

        let mut value = old.clone().into_value();
        if let Some(status) = patch.get("status") {
            let mut wrapper = serde_json::Map::new();
            wrapper.insert("status".to_string(), status.clone());
            merge_patch(&mut value, &Value::Object(wrapper));
        }
        let updated = Document::from_value(value)?;

        self.finish_write(&mut guard, key, old, updated)
    }

    async fn delete(&self, key: &ObjectRef) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let stored = guard
            .documents
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if stored.finalizers().is_empty() {
            let doc = stored.clone();
            guard.documents.remove(key);
            drop(guard);
            debug!(key = %key, "document deleted");
            self.emit(WatchEvent::Deleted {
                key: key.clone(),
                doc,
            });
            return Ok(());
        }

        if stored.deletion_timestamp().is_none() {
            let old = stored.clone();
            stored.set_deletion_timestamp(Utc::now());
            // Stamping the deletion timestamp counts as a spec-visible write,
            // so watchers keyed on generation changes observe it.
            stored.set_generation(old.generation() + 1);
            let new = stored.clone();
            drop(guard);
            debug!(key = %key, "deletion requested, finalizers pending");
            self.emit(WatchEvent::Updated {
                key: key.clone(),
                old,
                new,
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

impl InMemoryStore {
    /// Commit an updated document, removing it instead if its deletion
    /// timestamp is set and the last finalizer just drained.
    fn finish_write(
        &self,
        guard: &mut Inner,
        key: &ObjectRef,
        old: Document,
        updated: Document,
    ) -> Result<Document, StoreError> {
        if updated.deletion_timestamp().is_some() && updated.finalizers().is_empty() {
            guard.documents.remove(key);
            debug!(key = %key, "finalizers drained, document removed");
            self.emit(WatchEvent::Deleted {
                key: key.clone(),
                doc: updated.clone(),
            });
            return Ok(updated);
        }

        guard.documents.insert(key.clone(), updated.clone());
        self.emit(WatchEvent::Updated {
            key: key.clone(),
            old,
            new: updated.clone(),
        });
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shepherd_document::PatchOp;

    fn cluster_doc(name: &str) -> Document {
        let mut doc = Document::new("shepherd.io/v1", "Cluster", "default", name);
        doc.set_nested(&["spec", "v1", "entry", "name"], json!(name));
        doc
    }

    fn cluster_key(name: &str) -> ObjectRef {
        ObjectRef::new(Gvk::new("shepherd.io", "v1", "Cluster"), "default", name)
    }

    #[tokio::test]
    async fn create_assigns_uid_and_generation_one() {
        let store = InMemoryStore::new();
        let created = store.create(cluster_doc("a")).await.unwrap();
        assert!(!created.uid().is_empty());
        assert_eq!(created.generation(), 1);
    }

    #[tokio::test]
    async fn get_unknown_document_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.get(&cluster_key("ghost")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn spec_patch_bumps_generation_status_patch_does_not() {
        let store = InMemoryStore::new();
        store.create(cluster_doc("a")).await.unwrap();
        let key = cluster_key("a");

        let patched = store
            .patch(
                &key,
                Patch::Merge(json!({"spec": {"v1": {"entry": {"size": "M5"}}}})),
            )
            .await
            .unwrap();
        assert_eq!(patched.generation(), 2);

        let patched = store
            .patch_status(&key, json!({"status": {"v1": {"stateName": "IDLE"}}}))
            .await
            .unwrap();
        assert_eq!(patched.generation(), 2);
        assert_eq!(
            patched.get_nested(&["status", "v1", "stateName"]),
            Some(&json!("IDLE"))
        );
    }

    #[tokio::test]
    async fn main_resource_patch_cannot_write_status() {
        let store = InMemoryStore::new();
        store.create(cluster_doc("a")).await.unwrap();
        let key = cluster_key("a");

        let patched = store
            .patch(&key, Patch::Merge(json!({"status": {"v1": {"stateName": "IDLE"}}})))
            .await
            .unwrap();
        assert!(patched.get_nested(&["status", "v1"]).is_none());
        assert_eq!(patched.generation(), 1, "status-only patch must not bump generation");
    }

    #[tokio::test]
    async fn delete_with_finalizers_stamps_deletion_timestamp() {
        let store = InMemoryStore::new();
        let mut doc = cluster_doc("a");
        doc.set_finalizers(vec!["shepherd.io/finalizer".into()]);
        store.create(doc).await.unwrap();
        let key = cluster_key("a");

        store.delete(&key).await.unwrap();
        let stored = store.get(&key).await.unwrap();
        assert!(stored.deletion_timestamp().is_some());

        // Draining the finalizer list removes the document for good.
        store
            .patch(
                &key,
                Patch::Json(vec![PatchOp::replace("/metadata/finalizers", json!([]))]),
            )
            .await
            .unwrap();
        assert!(store.get(&key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_without_finalizers_removes_immediately() {
        let store = InMemoryStore::new();
        store.create(cluster_doc("a")).await.unwrap();
        store.delete(&cluster_key("a")).await.unwrap();
        assert!(store.get(&cluster_key("a")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn watch_sees_create_update_delete() {
        let store = InMemoryStore::new();
        let mut events = store.subscribe();

        store.create(cluster_doc("a")).await.unwrap();
        let key = cluster_key("a");
        store
            .patch(&key, Patch::Merge(json!({"spec": {"v1": {"entry": {"size": "M5"}}}})))
            .await
            .unwrap();
        store.delete(&key).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), WatchEvent::Created { .. }));
        match events.recv().await.unwrap() {
            WatchEvent::Updated { old, new, .. } => {
                assert_eq!(old.generation(), 1);
                assert_eq!(new.generation(), 2);
            }
            other => panic!("expected update event, got {other:?}"),
        }
        assert!(matches!(events.recv().await.unwrap(), WatchEvent::Deleted { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_kind() {
        let store = InMemoryStore::new();
        store.create(cluster_doc("a")).await.unwrap();
        store
            .create(Document::new("shepherd.io/v1", "Project", "default", "p"))
            .await
            .unwrap();

        let clusters = store.list(&Gvk::new("shepherd.io", "v1", "Cluster")).await.unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name(), "a");
    }
}
