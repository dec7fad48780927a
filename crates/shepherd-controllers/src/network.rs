use async_trait::async_trait;
use shepherd_cloud::{NetworkPermissionEntry, PaginatedNetworkAccess};
use shepherd_document::{
    find_condition, Document, DocumentError, READY_CONDITION, STATE_CONDITION,
};
use shepherd_engine::{
    error, next_state, Context, HandlerResult, InState, ResourceState, StateHandler,
    READY_REASON_ERROR,
};

use crate::payload::AccessListParameters;
use crate::VERSION;

/// Drives NetworkPermissionEntry documents. The declared entry list is the
/// whole truth for the project's access list: an upsert wipes the list and
/// recreates it, and deletion drains it entry by entry.
pub struct NetworkPermissionHandler;

impl NetworkPermissionHandler {
    pub fn new() -> Self {
        NetworkPermissionHandler
    }

    async fn handle_idle(
        &self,
        ctx: &Context,
        doc: &mut Document,
        current_state: ResourceState,
        final_state: ResourceState,
    ) -> HandlerResult {
        let conditions = doc.conditions().in_state(current_state)?;
        let observed = find_condition(&conditions, STATE_CONDITION).map(|c| c.observed_generation);
        let ready_errored = find_condition(&conditions, READY_CONDITION)
            .map(|c| c.reason == READY_REASON_ERROR)
            .unwrap_or(false);
        if observed == Some(doc.generation())
            && !ready_errored
            && current_state != ResourceState::Initial
        {
            return next_state(current_state, "Upserted network permission entries");
        }

        let group_id = group_id(doc).in_state(current_state)?;
        let entries: Vec<NetworkPermissionEntry> = doc
            .nested_as(&["spec", VERSION, "entry"])
            .in_state(current_state)?;

        let existing = ctx
            .clients
            .access_lists
            .list_entries(&group_id)
            .await
            .map_err(|err| format!("failed to list network permission entries: {err}"))
            .in_state(current_state)?;
        for entry in &existing.results {
            if let Some(value) = entry.entry_value() {
                ctx.clients
                    .access_lists
                    .delete_entry(&group_id, value)
                    .await
                    .map_err(|err| format!("failed to delete network permission entry: {err}"))
                    .in_state(current_state)?;
            }
        }

        let response = ctx
            .clients
            .access_lists
            .create_entries(&group_id, &entries)
            .await
            .map_err(|err| format!("failed to create network permission entries: {err}"))
            .in_state(current_state)?;
        set_status(doc, &response).in_state(current_state)?;

        next_state(final_state, "Upserted network permission entries")
    }

    /// Drain the project's access list. "Not found" for the whole project
    /// means there is nothing left to remove.
    async fn sweep(
        &self,
        ctx: &Context,
        doc: &mut Document,
        current_state: ResourceState,
    ) -> HandlerResult {
        let group_id = group_id(doc).in_state(current_state)?;

        let existing = match ctx.clients.access_lists.list_entries(&group_id).await {
            Err(err) if err.is_code("GROUP_NOT_FOUND") => {
                return next_state(ResourceState::Deleted, "Network permission entries deleted")
            }
            Err(err) => {
                return error(
                    current_state,
                    format!("failed to list network permission entries: {err}"),
                )
            }
            Ok(existing) => existing,
        };

        for entry in &existing.results {
            if let Some(value) = entry.entry_value() {
                ctx.clients
                    .access_lists
                    .delete_entry(&group_id, value)
                    .await
                    .map_err(|err| format!("failed to delete network permission entry: {err}"))
                    .in_state(current_state)?;
            }
        }

        next_state(ResourceState::Deleted, "Network permission entries deleted")
    }
}

impl Default for NetworkPermissionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateHandler for NetworkPermissionHandler {
    async fn handle_initial(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Initial, ResourceState::Created)
            .await
    }

    async fn handle_created(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Created, ResourceState::Updated)
            .await
    }

    async fn handle_updated(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Updated, ResourceState::Updated)
            .await
    }

    async fn handle_deletion_requested(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.sweep(ctx, doc, ResourceState::DeletionRequested).await
    }

    async fn handle_deleting(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.sweep(ctx, doc, ResourceState::Deleting).await
    }
}

fn group_id(doc: &Document) -> Result<String, DocumentError> {
    let params: AccessListParameters = doc.nested_as(&["spec", VERSION, "parameters"])?;
    Ok(params.group_id.unwrap_or_default())
}

fn set_status(doc: &mut Document, response: &PaginatedNetworkAccess) -> Result<(), DocumentError> {
    doc.set_nested_as(&["status", VERSION], response)
}
