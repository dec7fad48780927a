use std::env;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::api::{AccessListsApi, ClustersApi, FlexClustersApi, ProjectsApi};
use crate::error::{ApiError, CloudError};
use crate::types::{
    ClusterDescription, FlexClusterDescription, NetworkPermissionEntry, PaginatedNetworkAccess,
    Project, ProjectUpdate,
};

pub const ENV_PUBLIC_KEY: &str = "SHEPHERD_PUBLIC_API_KEY";
pub const ENV_PRIVATE_KEY: &str = "SHEPHERD_PRIVATE_API_KEY";
pub const ENV_BASE_URL: &str = "SHEPHERD_API_URL";

/// Characters that cannot appear raw inside one path segment. Access-list
/// entry values are often CIDR blocks, whose `/` would otherwise split the
/// segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/')
    .add(b'%');

fn access_list_entry_path(group_id: &str, entry_value: &str) -> String {
    format!(
        "/api/v1/groups/{group_id}/accessList/{}",
        utf8_percent_encode(entry_value, PATH_SEGMENT)
    )
}

/// reqwest-backed implementation of every API facet.
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    public_key: String,
    private_key: String,
}

impl HttpApi {
    pub fn from_env() -> Result<Self, CloudError> {
        let public_key =
            env::var(ENV_PUBLIC_KEY).map_err(|_| CloudError::MissingCredentials(ENV_PUBLIC_KEY))?;
        let private_key = env::var(ENV_PRIVATE_KEY)
            .map_err(|_| CloudError::MissingCredentials(ENV_PRIVATE_KEY))?;
        let base_url =
            env::var(ENV_BASE_URL).map_err(|_| CloudError::MissingCredentials(ENV_BASE_URL))?;
        Ok(HttpApi::new(&base_url, &public_key, &private_key))
    }

    pub fn new(base_url: &str, public_key: &str, private_key: &str) -> Self {
        HttpApi {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            public_key: public_key.to_string(),
            private_key: private_key.to_string(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        debug!(%method, path, "external api call");
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.public_key, Some(&self.private_key))
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CloudError> {
        let response = request.send().await?;
        Self::check(response).await?.json().await.map_err(Into::into)
    }

    async fn send_no_body(&self, request: RequestBuilder) -> Result<(), CloudError> {
        Self::check(request.send().await?).await.map(|_| ())
    }

    async fn check(response: Response) -> Result<Response, CloudError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let mut api_error = response.json::<ApiError>().await.unwrap_or_default();
        api_error.status = status.as_u16();
        Err(CloudError::Api(api_error))
    }

    async fn json<Body: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &Body,
    ) -> Result<T, CloudError> {
        self.send(self.request(method, path).json(body)).await
    }
}

#[async_trait]
impl ProjectsApi for HttpApi {
    async fn create_project(&self, project: &Project) -> Result<Project, CloudError> {
        self.json(Method::POST, "/api/v1/groups", project).await
    }

    async fn get_project(&self, project_id: &str) -> Result<Project, CloudError> {
        self.send(self.request(Method::GET, &format!("/api/v1/groups/{project_id}")))
            .await
    }

    async fn update_project(
        &self,
        project_id: &str,
        update: &ProjectUpdate,
    ) -> Result<Project, CloudError> {
        self.json(Method::PATCH, &format!("/api/v1/groups/{project_id}"), update)
            .await
    }

    async fn delete_project(&self, project_id: &str) -> Result<(), CloudError> {
        self.send_no_body(self.request(Method::DELETE, &format!("/api/v1/groups/{project_id}")))
            .await
    }
}

#[async_trait]
impl ClustersApi for HttpApi {
    async fn create_cluster(
        &self,
        group_id: &str,
        cluster: &ClusterDescription,
    ) -> Result<ClusterDescription, CloudError> {
        self.json(Method::POST, &format!("/api/v1/groups/{group_id}/clusters"), cluster)
            .await
    }

    async fn get_cluster(
        &self,
        group_id: &str,
        name: &str,
    ) -> Result<ClusterDescription, CloudError> {
        self.send(self.request(Method::GET, &format!("/api/v1/groups/{group_id}/clusters/{name}")))
            .await
    }

    async fn update_cluster(
        &self,
        group_id: &str,
        name: &str,
        cluster: &ClusterDescription,
    ) -> Result<ClusterDescription, CloudError> {
        self.json(
            Method::PATCH,
            &format!("/api/v1/groups/{group_id}/clusters/{name}"),
            cluster,
        )
        .await
    }

    async fn delete_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError> {
        self.send_no_body(
            self.request(Method::DELETE, &format!("/api/v1/groups/{group_id}/clusters/{name}")),
        )
        .await
    }
}

#[async_trait]
impl FlexClustersApi for HttpApi {
    async fn create_flex_cluster(
        &self,
        group_id: &str,
        cluster: &FlexClusterDescription,
    ) -> Result<FlexClusterDescription, CloudError> {
        self.json(
            Method::POST,
            &format!("/api/v1/groups/{group_id}/flexClusters"),
            cluster,
        )
        .await
    }

    async fn get_flex_cluster(
        &self,
        group_id: &str,
        name: &str,
    ) -> Result<FlexClusterDescription, CloudError> {
        self.send(
            self.request(
                Method::GET,
                &format!("/api/v1/groups/{group_id}/flexClusters/{name}"),
            ),
        )
        .await
    }

    async fn update_flex_cluster(
        &self,
        group_id: &str,
        name: &str,
        cluster: &FlexClusterDescription,
    ) -> Result<FlexClusterDescription, CloudError> {
        self.json(
            Method::PATCH,
            &format!("/api/v1/groups/{group_id}/flexClusters/{name}"),
            cluster,
        )
        .await
    }

    async fn delete_flex_cluster(&self, group_id: &str, name: &str) -> Result<(), CloudError> {
        self.send_no_body(self.request(
            Method::DELETE,
            &format!("/api/v1/groups/{group_id}/flexClusters/{name}"),
        ))
        .await
    }
}

#[async_trait]
impl AccessListsApi for HttpApi {
    async fn list_entries(&self, group_id: &str) -> Result<PaginatedNetworkAccess, CloudError> {
        self.send(self.request(Method::GET, &format!("/api/v1/groups/{group_id}/accessList")))
            .await
    }

    async fn create_entries(
        &self,
        group_id: &str,
        entries: &[NetworkPermissionEntry],
    ) -> Result<PaginatedNetworkAccess, CloudError> {
        self.json(
            Method::POST,
            &format!("/api/v1/groups/{group_id}/accessList"),
            &entries,
        )
        .await
    }

    async fn delete_entry(&self, group_id: &str, entry_value: &str) -> Result<(), CloudError> {
        self.send_no_body(self.request(
            Method::DELETE,
            &access_list_entry_path(group_id, entry_value),
        ))
        .await
    }
}
