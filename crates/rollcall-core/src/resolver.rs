//! Identity resolver contract: encoded still in, ranked candidates out.

use crate::types::{Candidate, StillImage};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),
    #[error("resolver unreachable: {0}")]
    Unreachable(String),
    #[error("resolver rejected image: {0}")]
    MalformedImage(String),
    #[error("resolver service error: {0}")]
    Service(String),
    #[error("malformed resolver response: {0}")]
    MalformedResponse(String),
}

/// Resolves a face image to zero or more candidates, best guess first.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// `scope` optionally narrows the search to one classroom.
    async fn resolve(
        &self,
        scope: Option<&str>,
        image: &StillImage,
    ) -> Result<Vec<Candidate>, ResolverError>;
}
