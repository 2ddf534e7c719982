use shared::error::{ApiError, ApiException};
use thiserror::Error;

/// Failure of a collaborator or follow-up step after a mutation committed.
/// Logged and counted, never returned to the original caller.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("moderation provider failed: {0}")]
    Moderation(String),
    #[error("push provider failed: {0}")]
    Push(String),
    #[error("storage failed: {0}")]
    Storage(String),
    #[error("follow-up rejected: {0}")]
    Rejected(#[from] ApiException),
}

impl DependencyError {
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }
}

impl From<ApiError> for DependencyError {
    fn from(value: ApiError) -> Self {
        Self::Rejected(value.into())
    }
}
