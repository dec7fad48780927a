use std::sync::Arc;

use async_trait::async_trait;
use shepherd_cloud::{FlexClusterDescription, STATE_CREATING, STATE_IDLE, STATE_UPDATING};
use shepherd_document::{
    find_condition, Document, DocumentError, READY_CONDITION, STATE_CONDITION,
};
use shepherd_engine::{
    error, next_state, Context, EngineError, HandlerResult, InState, ResourceState, StateHandler,
    ANNOTATION_EXTERNAL_GROUP_ID, ANNOTATION_EXTERNAL_NAME, READY_REASON_ERROR,
};
use shepherd_store::{DocumentStore, ObjectRef, Patch};

use crate::payload::FlexClusterParameters;
use crate::VERSION;

/// Drives FlexCluster documents. Same lifecycle shape as [`crate::cluster`],
/// against the flex facet; coordinates for polling come from the
/// last-observed status rather than the declared entry.
pub struct FlexClusterHandler {
    store: Arc<dyn DocumentStore>,
}

impl FlexClusterHandler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        FlexClusterHandler { store }
    }

    async fn handle_idle(
        &self,
        ctx: &Context,
        doc: &mut Document,
        final_state: ResourceState,
    ) -> HandlerResult {
        let response = self
            .refresh_status(ctx, doc)
            .await
            .map_err(|err| format!("failed to update status: {err}"))
            .in_state(final_state)?;

        if response.state_name.as_deref() != Some(STATE_IDLE) {
            return next_state(ResourceState::Updating, "Updating flex cluster");
        }

        let conditions = doc.conditions().in_state(final_state)?;
        let observed = find_condition(&conditions, STATE_CONDITION).map(|c| c.observed_generation);
        let ready_errored = find_condition(&conditions, READY_CONDITION)
            .map(|c| c.reason == READY_REASON_ERROR)
            .unwrap_or(false);
        if observed == Some(doc.generation()) && !ready_errored {
            return next_state(final_state, "Upserted flex cluster");
        }

        let status = flex_status(doc).in_state(final_state)?;
        let entry = flex_entry(doc).in_state(final_state)?;
        let response = ctx
            .clients
            .flex_clusters
            .update_flex_cluster(
                status.group_id.as_deref().unwrap_or_default(),
                status.name.as_deref().unwrap_or_default(),
                &entry,
            )
            .await
            .map_err(|err| format!("failed to update flex cluster: {err}"))
            .in_state(ResourceState::Updating)?;
        set_status(doc, &response).in_state(ResourceState::Updating)?;

        next_state(ResourceState::Updating, "Updating flex cluster")
    }

    async fn handle_upserting(
        &self,
        ctx: &Context,
        doc: &mut Document,
        current_state: ResourceState,
        final_state: ResourceState,
    ) -> HandlerResult {
        let response = self
            .refresh_status(ctx, doc)
            .await
            .map_err(|err| format!("failed to get flex cluster: {err}"))
            .in_state(current_state)?;

        match response.state_name.as_deref() {
            Some(STATE_CREATING) | Some(STATE_UPDATING) => {
                next_state(current_state, "Upserting flex cluster")
            }
            _ => next_state(final_state, "Upserted flex cluster"),
        }
    }

    async fn refresh_status(
        &self,
        ctx: &Context,
        doc: &mut Document,
    ) -> Result<FlexClusterDescription, EngineError> {
        let status = flex_status(doc)?;
        let response = ctx
            .clients
            .flex_clusters
            .get_flex_cluster(
                status.group_id.as_deref().unwrap_or_default(),
                status.name.as_deref().unwrap_or_default(),
            )
            .await?;
        set_status(doc, &response)?;
        Ok(response)
    }
}

#[async_trait]
impl StateHandler for FlexClusterHandler {
    async fn handle_initial(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::Initial;
        let params: FlexClusterParameters = doc
            .nested_as(&["spec", VERSION, "parameters"])
            .in_state(state)?;
        let entry = flex_entry(doc).in_state(state)?;

        let response = ctx
            .clients
            .flex_clusters
            .create_flex_cluster(params.group_id.as_deref().unwrap_or_default(), &entry)
            .await
            .map_err(|err| format!("failed to create flex cluster: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Creating, "Creating flex cluster")
    }

    async fn handle_import_requested(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::ImportRequested;
        let name = doc
            .annotation(ANNOTATION_EXTERNAL_NAME)
            .ok_or_else(|| format!("missing {ANNOTATION_EXTERNAL_NAME}"))
            .in_state(state)?;
        let group_id = doc
            .annotation(ANNOTATION_EXTERNAL_GROUP_ID)
            .ok_or_else(|| format!("missing {ANNOTATION_EXTERNAL_GROUP_ID}"))
            .in_state(state)?;

        let response = ctx
            .clients
            .flex_clusters
            .get_flex_cluster(&group_id, &name)
            .await
            .map_err(|err| format!("failed to get flex cluster: {err}"))
            .in_state(state)?;

        doc.set_nested_as(&["spec", VERSION, "entry"], &response)
            .in_state(state)?;
        let key = ObjectRef::from_document(doc);
        *doc = self
            .store
            .patch(&key, Patch::Merge(doc.as_value().clone()))
            .await
            .map_err(|err| format!("failed to patch flex cluster: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Imported, "Flex cluster imported")
    }

    async fn handle_imported(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Imported).await
    }

    async fn handle_created(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Created).await
    }

    async fn handle_updated(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_idle(ctx, doc, ResourceState::Updated).await
    }

    async fn handle_creating(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_upserting(ctx, doc, ResourceState::Creating, ResourceState::Created)
            .await
    }

    async fn handle_updating(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        self.handle_upserting(ctx, doc, ResourceState::Updating, ResourceState::Updated)
            .await
    }

    async fn handle_deletion_requested(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::DeletionRequested;
        let status = flex_status(doc).in_state(state)?;

        let deleted = ctx
            .clients
            .flex_clusters
            .delete_flex_cluster(
                status.group_id.as_deref().unwrap_or_default(),
                status.name.as_deref().unwrap_or_default(),
            )
            .await;
        match deleted {
            Err(err) if err.is_code("CLUSTER_NOT_FOUND") => {
                return next_state(
                    ResourceState::Deleted,
                    "Flex cluster has been deleted in the external system",
                )
            }
            Err(err) => return error(state, format!("failed to delete flex cluster: {err}")),
            Ok(()) => {}
        }

        self.refresh_status(ctx, doc)
            .await
            .map_err(|err| format!("failed to update status: {err}"))
            .in_state(state)?;

        next_state(ResourceState::Deleting, "Deleting flex cluster")
    }

    async fn handle_deleting(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        match self.refresh_status(ctx, doc).await {
            Err(EngineError::Cloud(err)) if err.is_code("CLUSTER_NOT_FOUND") => next_state(
                ResourceState::Deleted,
                "Flex cluster has been deleted in the external system",
            ),
            Err(err) => error(
                ResourceState::Deleting,
                format!("failed to update status: {err}"),
            ),
            Ok(_) => next_state(ResourceState::Deleting, "Deleting flex cluster"),
        }
    }
}

fn flex_entry(doc: &Document) -> Result<FlexClusterDescription, DocumentError> {
    doc.nested_as(&["spec", VERSION, "entry"])
}

fn flex_status(doc: &Document) -> Result<FlexClusterDescription, DocumentError> {
    doc.nested_as(&["status", VERSION])
}

fn set_status(doc: &mut Document, response: &FlexClusterDescription) -> Result<(), DocumentError> {
    doc.set_nested_as(&["status", VERSION], response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;
    use shepherd_cloud::{ApiError, ClientSet, CloudError, FlexClustersApi};
    use shepherd_store::InMemoryStore;

    use crate::testutil::{context, unused_clients};

    #[derive(Default)]
    struct FakeFlex {
        responses: Mutex<VecDeque<Result<FlexClusterDescription, CloudError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeFlex {
        fn scripted(responses: Vec<Result<FlexClusterDescription, CloudError>>) -> Arc<Self> {
            Arc::new(FakeFlex {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn pop(&self, call: String) -> Result<FlexClusterDescription, CloudError> {
            self.calls.lock().unwrap().push(call);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(FlexClusterDescription::default()))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl FlexClustersApi for FakeFlex {
        async fn create_flex_cluster(
            &self,
            group_id: &str,
            cluster: &FlexClusterDescription,
        ) -> Result<FlexClusterDescription, CloudError> {
            let name = cluster.name.clone().unwrap_or_default();
            self.pop(format!("create {group_id}/{name}"))
        }

        async fn get_flex_cluster(
            &self,
            group_id: &str,
            name: &str,
        ) -> Result<FlexClusterDescription, CloudError> {
            self.pop(format!("get {group_id}/{name}"))
        }

        async fn update_flex_cluster(
            &self,
            group_id: &str,
            name: &str,
            _cluster: &FlexClusterDescription,
        ) -> Result<FlexClusterDescription, CloudError> {
            self.pop(format!("update {group_id}/{name}"))
        }

        async fn delete_flex_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError> {
            self.pop(format!("delete {group_id}/{name}")).map(|_| ())
        }
    }

    fn clients_with(fake: Arc<FakeFlex>) -> ClientSet {
        let mut clients = unused_clients();
        clients.flex_clusters = fake;
        clients
    }

    fn described(name: &str, state: &str) -> FlexClusterDescription {
        FlexClusterDescription {
            group_id: Some("g1".into()),
            name: Some(name.into()),
            state_name: Some(state.into()),
            ..Default::default()
        }
    }

    fn flex_doc(name: &str) -> Document {
        let mut doc = Document::new("shepherd.io/v1", "FlexCluster", "default", name);
        doc.set_nested(&["spec", "v1", "parameters"], json!({"groupId": "g1"}));
        doc.set_nested(&["spec", "v1", "entry"], json!({"name": name}));
        doc
    }

    fn handler() -> FlexClusterHandler {
        FlexClusterHandler::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn initial_creates_the_flex_cluster() {
        let fake = FakeFlex::scripted(vec![Ok(described("a", "CREATING"))]);
        let ctx = context("FlexCluster", "a", clients_with(fake.clone()));
        let mut doc = flex_doc("a");

        let transition = handler().handle_initial(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Creating));
        assert_eq!(fake.calls(), vec!["create g1/a"]);
        assert_eq!(
            doc.get_nested(&["status", "v1", "stateName"]),
            Some(&json!("CREATING"))
        );
    }

    #[tokio::test]
    async fn upserting_polls_by_status_coordinates() {
        let fake = FakeFlex::scripted(vec![Ok(described("a", "IDLE"))]);
        let ctx = context("FlexCluster", "a", clients_with(fake.clone()));
        let mut doc = flex_doc("a");
        doc.set_nested(
            &["status", "v1"],
            json!({"groupId": "g1", "name": "a", "stateName": "CREATING"}),
        );

        let transition = handler().handle_creating(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Created));
        assert_eq!(fake.calls(), vec!["get g1/a"]);
    }

    #[tokio::test]
    async fn import_requires_the_group_annotation() {
        let ctx = context("FlexCluster", "a", unused_clients());
        let mut doc = flex_doc("a");
        doc.set_annotation(ANNOTATION_EXTERNAL_NAME, "a");

        let err = handler()
            .handle_import_requested(&ctx, &mut doc)
            .await
            .unwrap_err();
        assert_eq!(err.state, ResourceState::ImportRequested);
        assert!(err
            .to_string()
            .contains("missing shepherd.io/external-group-id"));
    }

    #[tokio::test]
    async fn deletion_treats_not_found_as_done() {
        let not_found = CloudError::Api(ApiError {
            status: 404,
            error_code: "CLUSTER_NOT_FOUND".into(),
            detail: "gone".into(),
        });
        let fake = FakeFlex::scripted(vec![Err(not_found)]);
        let ctx = context("FlexCluster", "a", clients_with(fake));
        let mut doc = flex_doc("a");
        doc.set_nested(&["status", "v1"], json!({"groupId": "g1", "name": "a"}));

        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));
    }
}
