use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Could not open DB for reading")]
    ReadError,
    #[error("Failed to lock database")]
    LockError,
    #[error("DecodeError")]
    DecodeError,
    #[error("{0}")]
    Custom(String),
}
