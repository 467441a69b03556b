//! Directory contract: registration number to ledger account.

use crate::types::{Account, ClassroomId, RegistrationNumber};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("directory timed out after {0:?}")]
    Timeout(Duration),
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// `Ok(None)` means the registration number is not enrolled in `classroom`.
    async fn account_for(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
    ) -> Result<Option<Account>, DirectoryError>;
}
