use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shepherd_document::{Document, PatchOp};
use tokio::sync::broadcast;

use crate::error::StoreError;

/// A watched resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Gvk {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
        }
    }

}

/// Store coordinates of a single document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(gvk: Gvk, namespace: &str, name: &str) -> Self {
        ObjectRef {
            gvk,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_document(doc: &Document) -> Self {
        let api_version = doc.api_version();
        let (group, version) = api_version.split_once('/').unwrap_or(("", api_version));
        ObjectRef {
            gvk: Gvk::new(group, version, doc.kind()),
            namespace: doc.namespace().to_string(),
            name: doc.name().to_string(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.gvk.kind, self.namespace, self.name)
    }
}

/// Patch payload accepted by [`DocumentStore::patch`].
#[derive(Debug, Clone)]
pub enum Patch {
    /// RFC 7386 merge patch over the whole document. The `status` subtree is
    /// ignored here; status is written through the status subresource only.
    Merge(Value),
    /// RFC 6902 operations, used for finalizer mutation.
    Json(Vec<PatchOp>),
}

/// A change notification emitted by the store.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Created {
        key: ObjectRef,
        doc: Document,
    },
    Updated {
        key: ObjectRef,
        old: Document,
        new: Document,
    },
    Deleted {
        key: ObjectRef,
        doc: Document,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &ObjectRef {
        match self {
            WatchEvent::Created { key, .. } => key,
            WatchEvent::Updated { key, .. } => key,
            WatchEvent::Deleted { key, .. } => key,
        }
    }
}

/// CRUD plus status subresource over control-plane documents.
///
/// The store owns generation accounting: any write that changes the `spec`
/// subtree bumps `metadata.generation`; status writes never do. A delete
/// request against a document carrying finalizers only stamps
/// `metadata.deletionTimestamp`; the document is physically removed once its
/// finalizer list drains.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    async fn get(&self, key: &ObjectRef) -> Result<Document, StoreError>;

    async fn list(&self, gvk: &Gvk) -> Result<Vec<Document>, StoreError>;

    async fn create(&self, doc: Document) -> Result<Document, StoreError>;

    async fn patch(&self, key: &ObjectRef, patch: Patch) -> Result<Document, StoreError>;

    /// Merge-patch the status subresource. Only the `status` subtree of the
    /// payload is applied.
    async fn patch_status(&self, key: &ObjectRef, patch: Value) -> Result<Document, StoreError>;

    async fn delete(&self, key: &ObjectRef) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;
}
