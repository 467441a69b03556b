//! Enrollment-side operations: classrooms, students, account bindings.

use crate::types::{Account, Classroom, ClassroomId, RegistrationNumber, Student};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("classroom name already exists: {0}")]
    DuplicateName(String),
    #[error("registration number already enrolled: {0}")]
    DuplicateRegNo(RegistrationNumber),
    #[error("unknown classroom: {0}")]
    UnknownClassroom(ClassroomId),
    #[error("student not enrolled: {0}")]
    UnknownStudent(RegistrationNumber),
    #[error("account already bound to another student: {0}")]
    AccountInUse(Account),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ClassroomRegistry: Send + Sync {
    async fn create_classroom(&self, name: &str) -> Result<Classroom, RegistryError>;

    async fn classrooms(&self) -> Result<Vec<Classroom>, RegistryError>;

    async fn classroom(&self, id: &ClassroomId) -> Result<Option<Classroom>, RegistryError> {
        Ok(self.classrooms().await?.into_iter().find(|c| &c.id == id))
    }

    async fn add_student(
        &self,
        classroom: &ClassroomId,
        name: &str,
        reg_no: &RegistrationNumber,
    ) -> Result<(), RegistryError>;

    /// Bind `account` to an enrolled student. Rebinding the same pair is a no-op.
    async fn bind_account(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
        account: &Account,
    ) -> Result<(), RegistryError>;

    async fn students(&self, classroom: &ClassroomId) -> Result<Vec<Student>, RegistryError>;
}

/// Reject blank names and registration numbers before they reach a backend.
pub fn validate_label(kind: &str, value: &str) -> Result<(), RegistryError> {
    if value.trim().is_empty() {
        return Err(RegistryError::InvalidInput(format!("{kind} must not be empty")));
    }
    Ok(())
}
