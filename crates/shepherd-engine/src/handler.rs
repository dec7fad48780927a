use async_trait::async_trait;
use shepherd_document::Document;

use crate::context::Context;
use crate::result::{HandlerResult, Transition};
use crate::state::ResourceState;

fn stay(state: ResourceState) -> HandlerResult {
    Ok(Transition {
        next_state: Some(state),
        ..Transition::default()
    })
}

/// Per-kind state handlers, one per non-terminal lifecycle state.
///
/// A kind that does not support an operation keeps the default body, which is
/// a same-state no-op (for example, kinds without import support omit the
/// `ImportRequested`/`Imported` handlers). `Deleted` is terminal and never
/// dispatched.
///
/// Handlers own `spec.<version>.*` and `status.<version>` on the document;
/// they must never touch `status.conditions` or `metadata.finalizers`, which
/// belong to the engine. External-API operations must tolerate repetition: a
/// cancelled reconciliation is simply retried from the persisted state.
#[async_trait]
pub trait StateHandler: Send + Sync + 'static {
    async fn handle_initial(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Initial)
    }

    async fn handle_import_requested(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::ImportRequested)
    }

    async fn handle_imported(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Imported)
    }

    async fn handle_creating(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Creating)
    }

    async fn handle_created(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Created)
    }

    async fn handle_updating(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Updating)
    }

    async fn handle_updated(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Updated)
    }

    async fn handle_deletion_requested(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::DeletionRequested)
    }

    async fn handle_deleting(&self, _ctx: &Context, _doc: &mut Document) -> HandlerResult {
        stay(ResourceState::Deleting)
    }
}
