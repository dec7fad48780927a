use shepherd_document::DocumentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document '{0}' not found")]
    NotFound(String),

    #[error("document '{0}' already exists")]
    AlreadyExists(String),

    #[error("malformed document: {0}")]
    Document(#[from] DocumentError),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
