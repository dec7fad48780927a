use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CloudError;
use crate::http::HttpApi;
use crate::types::{
    ClusterDescription, FlexClusterDescription, NetworkPermissionEntry, PaginatedNetworkAccess,
    Project, ProjectUpdate,
};

#[async_trait]
pub trait ProjectsApi: Send + Sync + 'static {
    async fn create_project(&self, project: &Project) -> Result<Project, CloudError>;
    async fn get_project(&self, project_id: &str) -> Result<Project, CloudError>;
    async fn update_project(
        &self,
        project_id: &str,
        update: &ProjectUpdate,
    ) -> Result<Project, CloudError>;
    async fn delete_project(&self, project_id: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait ClustersApi: Send + Sync + 'static {
    async fn create_cluster(
        &self,
        group_id: &str,
        cluster: &ClusterDescription,
    ) -> Result<ClusterDescription, CloudError>;
    async fn get_cluster(&self, group_id: &str, name: &str)
        -> Result<ClusterDescription, CloudError>;
    async fn update_cluster(
        &self,
        group_id: &str,
        name: &str,
        cluster: &ClusterDescription,
    ) -> Result<ClusterDescription, CloudError>;
    async fn delete_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait FlexClustersApi: Send + Sync + 'static {
    async fn create_flex_cluster(
        &self,
        group_id: &str,
        cluster: &FlexClusterDescription,
    ) -> Result<FlexClusterDescription, CloudError>;
    async fn get_flex_cluster(
        &self,
        group_id: &str,
        name: &str,
    ) -> Result<FlexClusterDescription, CloudError>;
    async fn update_flex_cluster(
        &self,
        group_id: &str,
        name: &str,
        cluster: &FlexClusterDescription,
    ) -> Result<FlexClusterDescription, CloudError>;
    async fn delete_flex_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait AccessListsApi: Send + Sync + 'static {
    async fn list_entries(&self, group_id: &str) -> Result<PaginatedNetworkAccess, CloudError>;
    async fn create_entries(
        &self,
        group_id: &str,
        entries: &[NetworkPermissionEntry],
    ) -> Result<PaginatedNetworkAccess, CloudError>;
    async fn delete_entry(&self, group_id: &str, entry_value: &str) -> Result<(), CloudError>;
}

/// The external-API facets a reconciliation needs, bundled so the dispatcher
/// can hand them to handlers through the request-scoped context with one
/// uniform shape across kinds.
#[derive(Clone)]
pub struct ClientSet {
    pub projects: Arc<dyn ProjectsApi>,
    pub clusters: Arc<dyn ClustersApi>,
    pub flex_clusters: Arc<dyn FlexClustersApi>,
    pub access_lists: Arc<dyn AccessListsApi>,
}

impl ClientSet {
    /// Build the HTTP client set from ambient credentials. Cheap enough to
    /// construct per reconcile.
    pub fn from_env() -> Result<Self, CloudError> {
        let http = Arc::new(HttpApi::from_env()?);
        Ok(ClientSet {
            projects: http.clone(),
            clusters: http.clone(),
            flex_clusters: http.clone(),
            access_lists: http,
        })
    }
}
