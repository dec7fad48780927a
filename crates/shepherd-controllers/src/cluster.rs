use std::sync::Arc;

use async_trait::async_trait;
use shepherd_cloud::{ClusterDescription, STATE_CREATING, STATE_IDLE, STATE_UPDATING};
use shepherd_document::{
    diff_paths, find_condition, Document, DocumentError, READY_CONDITION, STATE_CONDITION,
};
use shepherd_engine::{
    error, next_state, Context, EngineError, HandlerResult, InState, ResourceState, StateHandler,
    ANNOTATION_EXTERNAL_GROUP_ID, ANNOTATION_EXTERNAL_NAME, READY_REASON_ERROR,
};
use shepherd_store::{DocumentStore, ObjectRef, Patch};
use tracing::debug;

use crate::payload::ClusterParameters;
use crate::VERSION;

/// Drives Cluster documents against the external clusters API.
///
/// Cluster provisioning is asynchronous: creation and updates poll the
/// external `stateName` until it reports `IDLE`.
pub struct ClusterHandler {
    store: Arc<dyn DocumentStore>,
}

impl ClusterHandler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ClusterHandler { store }
    }

    /// Settled states: refresh external state, fall back to `Updating` when
    /// the external system is busy or the declared spec moved ahead of the
    /// observed generation.
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
            return next_state(ResourceState::Updating, "Updating cluster");
        }

        let conditions = doc.conditions().in_state(final_state)?;
        let observed = find_condition(&conditions, STATE_CONDITION).map(|c| c.observed_generation);
        let ready_errored = find_condition(&conditions, READY_CONDITION)
            .map(|c| c.reason == READY_REASON_ERROR)
            .unwrap_or(false);
        if observed == Some(doc.generation()) && !ready_errored {
            return next_state(final_state, "Upserted cluster");
        }

        let entry = cluster_entry(doc).in_state(final_state)?;
        log_changes(&entry, &response);

        let group_id = cluster_status(doc)
            .in_state(final_state)?
            .group_id
            .unwrap_or_default();
        let name = entry.name.clone().unwrap_or_default();
        let response = ctx
            .clients
            .clusters
            .update_cluster(&group_id, &name, &entry)
            .await
            .map_err(|err| format!("failed to update cluster: {err}"))
            .in_state(ResourceState::Updating)?;
        set_status(doc, &response).in_state(ResourceState::Updating)?;

        next_state(ResourceState::Updating, "Updating cluster")
    }

    /// Creation/update in flight: poll until the external system leaves the
    /// transitional state.
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
            .map_err(|err| format!("failed to get cluster: {err}"))
            .in_state(current_state)?;

        match response.state_name.as_deref() {
            Some(STATE_CREATING) | Some(STATE_UPDATING) => {
                next_state(current_state, "Upserting cluster")
            }
            _ => next_state(final_state, "Upserted cluster"),
        }
    }

    /// Fetch the external cluster by its status coordinates and mirror the
    /// response into `status.<version>`.
    async fn refresh_status(
        &self,
        ctx: &Context,
        doc: &mut Document,
    ) -> Result<ClusterDescription, EngineError> {
        let group_id = cluster_status(doc)?.group_id.unwrap_or_default();
        let name = cluster_entry(doc)?.name.unwrap_or_default();
        let response = ctx.clients.clusters.get_cluster(&group_id, &name).await?;
        set_status(doc, &response)?;
        Ok(response)
    }
}

#[async_trait]
impl StateHandler for ClusterHandler {
    async fn handle_initial(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::Initial;
        let params: ClusterParameters = doc
            .nested_as(&["spec", VERSION, "parameters"])
            .in_state(state)?;
        let entry = cluster_entry(doc).in_state(state)?;

        let response = ctx
            .clients
            .clusters
            .create_cluster(params.group_id.as_deref().unwrap_or_default(), &entry)
            .await
            .map_err(|err| format!("failed to create cluster: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Creating, "Creating cluster")
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
            .clusters
            .get_cluster(&group_id, &name)
            .await
            .map_err(|err| format!("failed to get cluster: {err}"))
            .in_state(state)?;

        doc.set_nested_as(&["spec", VERSION, "entry"], &response)
            .in_state(state)?;
        let key = ObjectRef::from_document(doc);
        *doc = self
            .store
            .patch(&key, Patch::Merge(doc.as_value().clone()))
            .await
            .map_err(|err| format!("failed to patch cluster: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Imported, "Cluster imported")
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
        let group_id = cluster_status(doc)
            .in_state(state)?
            .group_id
            .unwrap_or_default();
        let name = cluster_entry(doc).in_state(state)?.name.unwrap_or_default();

        match ctx.clients.clusters.delete_cluster(&group_id, &name).await {
            Err(err) if err.is_code("CLUSTER_NOT_FOUND") => {
                return next_state(
                    ResourceState::Deleted,
                    "Cluster has been deleted in the external system",
                )
            }
            Err(err) => return error(state, format!("failed to delete cluster: {err}")),
            Ok(()) => {}
        }

        self.refresh_status(ctx, doc)
            .await
            .map_err(|err| format!("failed to update status: {err}"))
            .in_state(state)?;

        next_state(ResourceState::Deleting, "Deleting cluster")
    }

    async fn handle_deleting(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        match self.refresh_status(ctx, doc).await {
            Err(EngineError::Cloud(err)) if err.is_code("CLUSTER_NOT_FOUND") => next_state(
                ResourceState::Deleted,
                "Cluster has been deleted in the external system",
            ),
            Err(err) => error(
                ResourceState::Deleting,
                format!("failed to update status: {err}"),
            ),
            Ok(_) => next_state(ResourceState::Deleting, "Deleting cluster"),
        }
    }
}

fn cluster_entry(doc: &Document) -> Result<ClusterDescription, DocumentError> {
    doc.nested_as(&["spec", VERSION, "entry"])
}

fn cluster_status(doc: &Document) -> Result<ClusterDescription, DocumentError> {
    doc.nested_as(&["status", VERSION])
}

fn set_status(doc: &mut Document, response: &ClusterDescription) -> Result<(), DocumentError> {
    doc.set_nested_as(&["status", VERSION], response)
}

/// Log the declared fields about to be pushed over the external state.
fn log_changes(declared: &ClusterDescription, observed: &ClusterDescription) {
    let (Ok(declared), Ok(observed)) = (
        serde_json::to_value(declared),
        serde_json::to_value(observed),
    ) else {
        return;
    };
    for path in diff_paths(&declared, &observed) {
        debug!(path, "cluster spec differs from external state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;
    use shepherd_cloud::{ApiError, ClientSet, ClustersApi, CloudError};
    use shepherd_document::{set_condition, Condition, ConditionStatus};
    use shepherd_engine::{READY_REASON_SETTLED, POLL_INTERVAL};
    use shepherd_store::InMemoryStore;

    use crate::testutil::{context, unused_clients};

    #[derive(Default)]
    struct FakeClusters {
        responses: Mutex<VecDeque<Result<ClusterDescription, CloudError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeClusters {
        fn scripted(responses: Vec<Result<ClusterDescription, CloudError>>) -> Arc<Self> {
            Arc::new(FakeClusters {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn pop(&self, call: String) -> Result<ClusterDescription, CloudError> {
            self.calls.lock().unwrap().push(call);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ClusterDescription::default()))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClustersApi for FakeClusters {
        async fn create_cluster(
            &self,
            group_id: &str,
            cluster: &ClusterDescription,
        ) -> Result<ClusterDescription, CloudError> {
            let name = cluster.name.clone().unwrap_or_default();
            self.pop(format!("create {group_id}/{name}"))
        }

        async fn get_cluster(
            &self,
            group_id: &str,
            name: &str,
        ) -> Result<ClusterDescription, CloudError> {
            self.pop(format!("get {group_id}/{name}"))
        }

        async fn update_cluster(
            &self,
            group_id: &str,
            name: &str,
            _cluster: &ClusterDescription,
        ) -> Result<ClusterDescription, CloudError> {
            self.pop(format!("update {group_id}/{name}"))
        }

        async fn delete_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError> {
            self.pop(format!("delete {group_id}/{name}")).map(|_| ())
        }
    }

    fn clients_with(fake: Arc<FakeClusters>) -> ClientSet {
        let mut clients = unused_clients();
        clients.clusters = fake;
        clients
    }

    fn described(name: &str, state: &str) -> ClusterDescription {
        ClusterDescription {
            group_id: Some("g1".into()),
            name: Some(name.into()),
            state_name: Some(state.into()),
            ..Default::default()
        }
    }

    fn not_found() -> CloudError {
        CloudError::Api(ApiError {
            status: 404,
            error_code: "CLUSTER_NOT_FOUND".into(),
            detail: "no such cluster".into(),
        })
    }

    fn cluster_doc(name: &str) -> Document {
        let mut doc = Document::new("shepherd.io/v1", "Cluster", "default", name);
        doc.set_nested(&["spec", "v1", "parameters"], json!({"groupId": "g1"}));
        doc.set_nested(&["spec", "v1", "entry"], json!({"name": name}));
        doc
    }

    fn settled_doc(name: &str, generation: i64, observed: i64) -> Document {
        let mut doc = cluster_doc(name);
        doc.set_generation(generation);
        doc.set_nested(
            &["status", "v1"],
            json!({"groupId": "g1", "name": name, "stateName": "IDLE"}),
        );
        let mut conditions = Vec::new();
        let mut state = Condition::new(STATE_CONDITION, ConditionStatus::True, "Created", "");
        state.observed_generation = observed;
        set_condition(&mut conditions, state);
        set_condition(
            &mut conditions,
            Condition::new(READY_CONDITION, ConditionStatus::True, READY_REASON_SETTLED, ""),
        );
        doc.set_conditions(&conditions).unwrap();
        doc
    }

    fn handler() -> ClusterHandler {
        ClusterHandler::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn initial_creates_the_cluster_and_starts_polling() {
        let fake = FakeClusters::scripted(vec![Ok(described("a", "CREATING"))]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = cluster_doc("a");

        let transition = handler().handle_initial(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Creating));
        assert_eq!(transition.requeue_after, Some(POLL_INTERVAL));
        assert_eq!(fake.calls(), vec!["create g1/a"]);
        assert_eq!(
            doc.get_nested(&["status", "v1", "stateName"]),
            Some(&json!("CREATING"))
        );
    }

    #[tokio::test]
    async fn creating_polls_until_the_external_system_goes_idle() {
        let fake = FakeClusters::scripted(vec![
            Ok(described("a", "CREATING")),
            Ok(described("a", "IDLE")),
        ]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler().handle_creating(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Creating));

        let transition = handler().handle_creating(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Created));
        assert_eq!(fake.calls(), vec!["get g1/a", "get g1/a"]);
    }

    #[tokio::test]
    async fn idle_converged_cluster_issues_no_update() {
        let fake = FakeClusters::scripted(vec![Ok(described("a", "IDLE"))]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler().handle_created(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Created));
        assert_eq!(fake.calls(), vec!["get g1/a"]);
    }

    #[tokio::test]
    async fn idle_with_stale_observed_generation_updates_the_cluster() {
        let fake = FakeClusters::scripted(vec![
            Ok(described("a", "IDLE")),
            Ok(described("a", "UPDATING")),
        ]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 2, 1);

        let transition = handler().handle_created(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Updating));
        assert_eq!(fake.calls(), vec!["get g1/a", "update g1/a"]);
        assert_eq!(
            doc.get_nested(&["status", "v1", "stateName"]),
            Some(&json!("UPDATING"))
        );
    }

    #[tokio::test]
    async fn idle_defers_to_in_flight_external_changes() {
        let fake = FakeClusters::scripted(vec![Ok(described("a", "UPDATING"))]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 2, 1);

        let transition = handler().handle_updated(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Updating));
        assert_eq!(fake.calls(), vec!["get g1/a"], "no update while external work is in flight");
    }

    #[tokio::test]
    async fn import_requires_both_annotations() {
        let ctx = context("Cluster", "a", unused_clients());
        let mut doc = cluster_doc("a");
        doc.set_annotation(ANNOTATION_EXTERNAL_GROUP_ID, "g1");

        let err = handler()
            .handle_import_requested(&ctx, &mut doc)
            .await
            .unwrap_err();
        assert_eq!(err.state, ResourceState::ImportRequested);
        assert!(err.to_string().contains("missing shepherd.io/external-name"));
    }

    #[tokio::test]
    async fn import_adopts_the_external_cluster_into_spec() {
        let store = Arc::new(InMemoryStore::new());
        let handler = ClusterHandler::new(store.clone());
        let mut seed = Document::new("shepherd.io/v1", "Cluster", "default", "a");
        seed.set_annotation(ANNOTATION_EXTERNAL_NAME, "a");
        seed.set_annotation(ANNOTATION_EXTERNAL_GROUP_ID, "g1");
        let mut doc = store.create(seed).await.unwrap();

        let fake = FakeClusters::scripted(vec![Ok(described("a", "IDLE"))]);
        let ctx = context("Cluster", "a", clients_with(fake));

        let transition = handler
            .handle_import_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Imported));

        // The retrieved body landed in the spec and was persisted; the spec
        // write bumped the generation.
        assert_eq!(
            doc.get_nested(&["spec", "v1", "entry", "name"]),
            Some(&json!("a"))
        );
        let stored = store.get(&ObjectRef::from_document(&doc)).await.unwrap();
        assert_eq!(
            stored.get_nested(&["spec", "v1", "entry", "stateName"]),
            Some(&json!("IDLE"))
        );
        assert_eq!(stored.generation(), 2);
    }

    #[tokio::test]
    async fn deletion_requested_treats_not_found_as_deleted() {
        let fake = FakeClusters::scripted(vec![Err(not_found())]);
        let ctx = context("Cluster", "a", clients_with(fake));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));
    }

    #[tokio::test]
    async fn deletion_requested_issues_delete_and_polls() {
        let fake = FakeClusters::scripted(vec![
            Ok(ClusterDescription::default()),
            Ok(described("a", "DELETING")),
        ]);
        let ctx = context("Cluster", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleting));
        assert_eq!(transition.requeue_after, Some(POLL_INTERVAL));
        assert_eq!(fake.calls(), vec!["delete g1/a", "get g1/a"]);
    }

    #[tokio::test]
    async fn deleting_polls_until_the_cluster_is_gone() {
        let fake = FakeClusters::scripted(vec![
            Ok(described("a", "DELETING")),
            Err(not_found()),
        ]);
        let ctx = context("Cluster", "a", clients_with(fake));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler().handle_deleting(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleting));

        let transition = handler().handle_deleting(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));
    }

    #[tokio::test]
    async fn other_api_errors_surface_as_handler_errors() {
        let fake = FakeClusters::scripted(vec![Err(CloudError::Api(ApiError {
            status: 503,
            error_code: "SERVICE_UNAVAILABLE".into(),
            detail: "try later".into(),
        }))]);
        let ctx = context("Cluster", "a", clients_with(fake));
        let mut doc = cluster_doc("a");

        let err = handler().handle_initial(&ctx, &mut doc).await.unwrap_err();
        assert_eq!(err.state, ResourceState::Initial);
        assert!(err.to_string().contains("failed to create cluster"));
        assert!(err.to_string().contains("SERVICE_UNAVAILABLE"));
    }
}
