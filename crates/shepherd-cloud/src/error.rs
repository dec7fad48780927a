use serde::Deserialize;
use thiserror::Error;

/// Structured error body returned by the external API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiError {
    #[serde(skip)]
    pub status: u16,
    pub error_code: String,
    pub detail: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.error_code.is_empty() {
            write!(f, "http status {}: {}", self.status, self.detail)
        } else {
            write!(f, "{} ({}): {}", self.error_code, self.status, self.detail)
        }
    }
}

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("api error: {0}")]
    Api(ApiError),

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("missing credentials: {0} is not set")]
    MissingCredentials(&'static str),
}

impl CloudError {
    /// True when the error carries the given external API error code, e.g.
    /// `CLUSTER_NOT_FOUND` or `GROUP_NOT_FOUND`.
    pub fn is_code(&self, code: &str) -> bool {
        matches!(self, CloudError::Api(api) if api.error_code == code)
    }
}
