use shepherd_cloud::CloudError;
use shepherd_document::DocumentError;
use shepherd_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("cloud api error: {0}")]
    Cloud(#[from] CloudError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error("{0}")]
    Message(String),
}

impl From<String> for EngineError {
    fn from(message: String) -> Self {
        EngineError::Message(message)
    }
}

impl From<&str> for EngineError {
    fn from(message: &str) -> Self {
        EngineError::Message(message.to_string())
    }
}
