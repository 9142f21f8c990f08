use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Coordination error: {0}")]
    CoordinationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
