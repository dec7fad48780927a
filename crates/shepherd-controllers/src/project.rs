use std::sync::Arc;

use async_trait::async_trait;
use shepherd_cloud::{Project, ProjectUpdate};
use shepherd_document::{
    find_condition, Document, DocumentError, READY_CONDITION, STATE_CONDITION,
};
use shepherd_engine::{
    error, next_state, Context, HandlerResult, InState, ResourceState, StateHandler,
    ANNOTATION_EXTERNAL_ID, READY_REASON_ERROR,
};
use shepherd_store::{DocumentStore, ObjectRef, Patch};

use crate::VERSION;

/// Drives Project documents. The external projects API is synchronous, so
/// creation settles straight to `Created` and updates straight to `Updated`
/// with no polling states in between.
pub struct ProjectHandler {
    store: Arc<dyn DocumentStore>,
}

impl ProjectHandler {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        ProjectHandler { store }
    }

    async fn handle_idle(
        &self,
        ctx: &Context,
        doc: &mut Document,
        current_state: ResourceState,
    ) -> HandlerResult {
        let status = project_status(doc).in_state(current_state)?;
        let response = ctx
            .clients
            .projects
            .get_project(status.id.as_deref().unwrap_or_default())
            .await
            .map_err(|err| format!("failed to get project: {err}"))
            .in_state(current_state)?;
        set_status(doc, &response).in_state(current_state)?;

        let conditions = doc.conditions().in_state(current_state)?;
        let observed = find_condition(&conditions, STATE_CONDITION).map(|c| c.observed_generation);
        let ready_errored = find_condition(&conditions, READY_CONDITION)
            .map(|c| c.reason == READY_REASON_ERROR)
            .unwrap_or(false);
        if observed == Some(doc.generation()) && !ready_errored {
            return next_state(current_state, "Upserted project");
        }

        let update: ProjectUpdate = doc
            .nested_as(&["spec", VERSION, "entry"])
            .in_state(current_state)?;
        let response = ctx
            .clients
            .projects
            .update_project(status.id.as_deref().unwrap_or_default(), &update)
            .await
            .map_err(|err| format!("failed to update project: {err}"))
            .in_state(current_state)?;
        set_status(doc, &response).in_state(current_state)?;

        next_state(ResourceState::Updated, "Project updated")
    }
}

#[async_trait]
impl StateHandler for ProjectHandler {
    async fn handle_initial(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::Initial;
        let entry = project_entry(doc).in_state(state)?;

        let response = ctx
            .clients
            .projects
            .create_project(&entry)
            .await
            .map_err(|err| format!("failed to create project: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Created, "Project created")
    }

    async fn handle_import_requested(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::ImportRequested;
        let id = doc
            .annotation(ANNOTATION_EXTERNAL_ID)
            .ok_or_else(|| format!("missing {ANNOTATION_EXTERNAL_ID}"))
            .in_state(state)?;

        let response = ctx
            .clients
            .projects
            .get_project(&id)
            .await
            .map_err(|err| format!("failed to get project: {err}"))
            .in_state(state)?;

        doc.set_nested_as(&["spec", VERSION, "entry"], &response)
            .in_state(state)?;
        let key = ObjectRef::from_document(doc);
        *doc = self
            .store
            .patch(&key, Patch::Merge(doc.as_value().clone()))
            .await
            .map_err(|err| format!("failed to patch project: {err}"))
            .in_state(state)?;
        set_status(doc, &response).in_state(state)?;

        next_state(ResourceState::Imported, "Project imported")
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

    async fn handle_deletion_requested(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::DeletionRequested;
        let status = project_status(doc).in_state(state)?;
        let id = match status.id {
            Some(id) => id,
            // Never created externally; nothing to tear down.
            None => return next_state(ResourceState::Deleted, "Project deleted"),
        };

        match ctx.clients.projects.delete_project(&id).await {
            Err(err) if err.is_code("GROUP_NOT_FOUND") => {
                next_state(ResourceState::Deleted, "Project deleted")
            }
            Err(err) => error(state, format!("failed to delete project: {err}")),
            Ok(()) => next_state(ResourceState::Deleting, "Deleting project"),
        }
    }

    async fn handle_deleting(&self, ctx: &Context, doc: &mut Document) -> HandlerResult {
        let state = ResourceState::Deleting;
        let status = project_status(doc).in_state(state)?;

        match ctx
            .clients
            .projects
            .get_project(status.id.as_deref().unwrap_or_default())
            .await
        {
            Err(err) if err.is_code("GROUP_NOT_FOUND") => {
                next_state(ResourceState::Deleted, "Project deleted")
            }
            Err(err) => error(state, format!("failed to get project: {err}")),
            Ok(_) => next_state(ResourceState::Deleted, "Project deleted"),
        }
    }
}

fn project_entry(doc: &Document) -> Result<Project, DocumentError> {
    doc.nested_as(&["spec", VERSION, "entry"])
}

fn project_status(doc: &Document) -> Result<Project, DocumentError> {
    doc.nested_as(&["status", VERSION])
}

fn set_status(doc: &mut Document, response: &Project) -> Result<(), DocumentError> {
    doc.set_nested_as(&["status", VERSION], response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use serde_json::json;
    use shepherd_cloud::{ApiError, ClientSet, CloudError, ProjectsApi};
    use shepherd_document::{set_condition, Condition, ConditionStatus};
    use shepherd_engine::READY_REASON_SETTLED;
    use shepherd_store::InMemoryStore;

    use crate::testutil::{context, unused_clients};

    #[derive(Default)]
    struct FakeProjects {
        responses: Mutex<VecDeque<Result<Project, CloudError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeProjects {
        fn scripted(responses: Vec<Result<Project, CloudError>>) -> Arc<Self> {
            Arc::new(FakeProjects {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn pop(&self, call: String) -> Result<Project, CloudError> {
            self.calls.lock().unwrap().push(call);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Project::default()))
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProjectsApi for FakeProjects {
        async fn create_project(&self, project: &Project) -> Result<Project, CloudError> {
            let name = project.name.clone().unwrap_or_default();
            self.pop(format!("create {name}"))
        }

        async fn get_project(&self, project_id: &str) -> Result<Project, CloudError> {
            self.pop(format!("get {project_id}"))
        }

        async fn update_project(
            &self,
            project_id: &str,
            _update: &ProjectUpdate,
        ) -> Result<Project, CloudError> {
            self.pop(format!("update {project_id}"))
        }

        async fn delete_project(&self, project_id: &str) -> Result<(), CloudError> {
            self.pop(format!("delete {project_id}")).map(|_| ())
        }
    }

    fn clients_with(fake: Arc<FakeProjects>) -> ClientSet {
        let mut clients = unused_clients();
        clients.projects = fake;
        clients
    }

    fn external(id: &str, name: &str) -> Project {
        Project {
            id: Some(id.into()),
            name: Some(name.into()),
            ..Default::default()
        }
    }

    fn group_not_found() -> CloudError {
        CloudError::Api(ApiError {
            status: 404,
            error_code: "GROUP_NOT_FOUND".into(),
            detail: "no such project".into(),
        })
    }

    fn project_doc(name: &str) -> Document {
        let mut doc = Document::new("shepherd.io/v1", "Project", "default", name);
        doc.set_nested(&["spec", "v1", "entry"], json!({"name": name}));
        doc
    }

    fn settled_doc(name: &str, generation: i64, observed: i64) -> Document {
        let mut doc = project_doc(name);
        doc.set_generation(generation);
        doc.set_nested(&["status", "v1"], json!({"id": "p1", "name": name}));
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

    fn handler() -> ProjectHandler {
        ProjectHandler::new(Arc::new(InMemoryStore::new()))
    }

    #[tokio::test]
    async fn initial_creates_synchronously() {
        let fake = FakeProjects::scripted(vec![Ok(external("p1", "a"))]);
        let ctx = context("Project", "a", clients_with(fake.clone()));
        let mut doc = project_doc("a");

        let transition = handler().handle_initial(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Created));
        assert_eq!(transition.requeue_after, None);
        assert_eq!(fake.calls(), vec!["create a"]);
        assert_eq!(doc.get_nested(&["status", "v1", "id"]), Some(&json!("p1")));
    }

    #[tokio::test]
    async fn idle_converged_project_stays_put() {
        let fake = FakeProjects::scripted(vec![Ok(external("p1", "a"))]);
        let ctx = context("Project", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler().handle_created(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Created));
        assert_eq!(fake.calls(), vec!["get p1"]);
    }

    #[tokio::test]
    async fn idle_with_new_generation_updates_and_settles() {
        let fake = FakeProjects::scripted(vec![
            Ok(external("p1", "a")),
            Ok(external("p1", "a-renamed")),
        ]);
        let ctx = context("Project", "a", clients_with(fake.clone()));
        let mut doc = settled_doc("a", 2, 1);

        let transition = handler().handle_created(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Updated));
        assert_eq!(fake.calls(), vec!["get p1", "update p1"]);
        assert_eq!(
            doc.get_nested(&["status", "v1", "name"]),
            Some(&json!("a-renamed"))
        );
    }

    #[tokio::test]
    async fn import_adopts_by_external_id() {
        let store = Arc::new(InMemoryStore::new());
        let handler = ProjectHandler::new(store.clone());
        let mut seed = Document::new("shepherd.io/v1", "Project", "default", "a");
        seed.set_annotation(ANNOTATION_EXTERNAL_ID, "p1");
        let mut doc = store.create(seed).await.unwrap();

        let fake = FakeProjects::scripted(vec![Ok(external("p1", "a"))]);
        let ctx = context("Project", "a", clients_with(fake));

        let transition = handler
            .handle_import_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Imported));
        let stored = store.get(&ObjectRef::from_document(&doc)).await.unwrap();
        assert_eq!(
            stored.get_nested(&["spec", "v1", "entry", "id"]),
            Some(&json!("p1"))
        );
    }

    #[tokio::test]
    async fn deletion_without_external_id_is_already_done() {
        let ctx = context("Project", "a", unused_clients());
        let mut doc = project_doc("a");

        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));
    }

    #[tokio::test]
    async fn deletion_handles_not_found_and_success() {
        let fake = FakeProjects::scripted(vec![Err(group_not_found())]);
        let ctx = context("Project", "a", clients_with(fake));
        let mut doc = settled_doc("a", 1, 1);
        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));

        let fake = FakeProjects::scripted(vec![Ok(Project::default())]);
        let ctx = context("Project", "a", clients_with(fake));
        let mut doc = settled_doc("a", 1, 1);
        let transition = handler()
            .handle_deletion_requested(&ctx, &mut doc)
            .await
            .unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleting));
    }

    #[tokio::test]
    async fn deleting_confirms_removal() {
        let fake = FakeProjects::scripted(vec![Err(group_not_found())]);
        let ctx = context("Project", "a", clients_with(fake));
        let mut doc = settled_doc("a", 1, 1);

        let transition = handler().handle_deleting(&ctx, &mut doc).await.unwrap();
        assert_eq!(transition.next_state, Some(ResourceState::Deleted));
    }
}
