//! Attendance ledger contract: classroom-scoped, append-only marks.

use crate::types::{Account, ClassroomId, MarkedStudent};
use async_trait::async_trait;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The (classroom, account) record is already present.
    #[error("attendance already recorded")]
    AlreadyExists,
    #[error("unknown classroom: {0}")]
    UnknownClassroom(ClassroomId),
    #[error("ledger rejected write: {0}")]
    Rejected(String),
    #[error("ledger timed out after {0:?}")]
    Timeout(Duration),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// The authoritative record of who has been marked present.
///
/// `mark_attendance` must be safe to call twice for the same pair: the
/// second call reports [`LedgerError::AlreadyExists`].
#[async_trait]
pub trait AttendanceLedger: Send + Sync {
    async fn marked_students(&self, classroom: &ClassroomId)
        -> Result<Vec<MarkedStudent>, LedgerError>;

    async fn marked_accounts(&self, classroom: &ClassroomId) -> Result<HashSet<Account>, LedgerError> {
        Ok(self
            .marked_students(classroom)
            .await?
            .into_iter()
            .map(|record| record.account)
            .collect())
    }

    async fn mark_attendance(&self, classroom: &ClassroomId, account: &Account)
        -> Result<(), LedgerError>;
}
