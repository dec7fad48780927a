use serde_json::json;
use shepherd_document::{Document, PatchOp};
use shepherd_store::{DocumentStore, ObjectRef, Patch, StoreError};

/// Make sure every finalizer in `finalizers` is present on the document,
/// patching the store if anything was missing.
pub async fn ensure_finalizers(
    store: &dyn DocumentStore,
    doc: &mut Document,
    finalizers: &[&str],
) -> Result<(), StoreError> {
    if finalizers.iter().all(|f| doc.has_finalizer(f)) {
        return Ok(());
    }
    for finalizer in finalizers {
        doc.add_finalizer(finalizer);
    }
    patch_finalizers(store, doc).await
}

/// Remove the named finalizers, leaving finalizers owned by other
/// controllers untouched.
pub async fn unset_finalizers(
    store: &dyn DocumentStore,
    doc: &mut Document,
    finalizers: &[&str],
) -> Result<(), StoreError> {
    for finalizer in finalizers {
        doc.remove_finalizer(finalizer);
    }
    patch_finalizers(store, doc).await
}

async fn patch_finalizers(store: &dyn DocumentStore, doc: &Document) -> Result<(), StoreError> {
    let key = ObjectRef::from_document(doc);
    // Replace the whole list; the in-memory document already carries the
    // other controllers' entries.
    store
        .patch(
            &key,
            Patch::Json(vec![PatchOp::replace(
                "/metadata/finalizers",
                json!(doc.finalizers()),
            )]),
        )
        .await?;
    Ok(())
}
