pub mod api;
pub mod error;
pub mod http;
pub mod types;

pub use api::{AccessListsApi, ClientSet, ClustersApi, FlexClustersApi, ProjectsApi};
pub use error::{ApiError, CloudError};
pub use http::HttpApi;
pub use types::{
    ClusterDescription, FlexClusterDescription, NetworkPermissionEntry, PaginatedNetworkAccess,
    Project, ProjectUpdate,
};

/// External state reported by cluster kinds when no change is in flight.
pub const STATE_IDLE: &str = "IDLE";
pub const STATE_CREATING: &str = "CREATING";
pub const STATE_UPDATING: &str = "UPDATING";
