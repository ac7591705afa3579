use crate::{embedding::EmbeddingError, feed::FeedError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("image with this content already exists at id {0}")]
    AlreadyExists(u64),

    #[error("item not found")]
    NotFound,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("io error: {0:?}")]
    IO(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<FeedError> for AppError {
    fn from(err: FeedError) -> Self {
        match err {
            FeedError::InvalidCursor(_) => AppError::InvalidInput(err.to_string()),
            FeedError::Embedding(EmbeddingError::InvalidInput(msg)) => {
                AppError::InvalidInput(format!("invalid filter: {msg}"))
            }
            FeedError::Embedding(EmbeddingError::ResourceUnavailable(msg)) => {
                AppError::Unavailable(msg)
            }
            FeedError::Embedding(err) => AppError::Other(err.into()),
            FeedError::Store(err) => AppError::Other(err),
        }
    }
}
