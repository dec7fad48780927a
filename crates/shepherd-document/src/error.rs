use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document root is not a JSON object")]
    NotAnObject,

    #[error("failed to convert field '{path}': {source}")]
    Conversion {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid patch path '{0}'")]
    InvalidPatchPath(String),

    #[error("patch target '{0}' does not exist")]
    MissingPatchTarget(String),
}
