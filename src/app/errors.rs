use crate::{items::StoreError, matching::MatchError, pipeline::BackfillError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Conflict(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reqwest error: {0:?}")]
    Reqwest(#[from] reqwest::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl From<MatchError> for AppError {
    fn from(err: MatchError) -> Self {
        match err {
            MatchError::NotFound(_) | MatchError::NoVector(_) => AppError::NotFound(err.to_string()),
            MatchError::InvalidK => AppError::InvalidArgument(err.to_string()),
            MatchError::Store(err) => AppError::Store(err),
        }
    }
}

impl From<BackfillError> for AppError {
    fn from(err: BackfillError) -> Self {
        match err {
            BackfillError::AlreadyRunning => AppError::Conflict(err.to_string()),
            BackfillError::Pool(_) => AppError::Other(err.into()),
        }
    }
}
