pub mod cluster;
pub mod flex;
pub mod network;
pub mod payload;
pub mod project;

pub use cluster::ClusterHandler;
pub use flex::FlexClusterHandler;
pub use network::NetworkPermissionHandler;
pub use project::ProjectHandler;

/// Version tag under which every kind keeps its `spec` and `status` payloads
/// (`spec.v1.parameters`, `spec.v1.entry`, `status.v1`).
pub const VERSION: &str = "v1";
