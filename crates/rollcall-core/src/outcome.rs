//! Terminal results of one verification-and-commit attempt.
//!
//! Expected outcomes of normal operation (`Marked`, `NoFaceDetected`,
//! `UnknownStudent`, `AlreadyMarked`) are values of [`AttemptOutcome`].
//! True failures are [`AttemptError`]. Reporting surfaces render both
//! through [`AttemptReport`], which keeps the distinction explicit.

use crate::capture::CaptureError;
use crate::directory::DirectoryError;
use crate::ledger::LedgerError;
use crate::resolver::ResolverError;
use crate::types::{Account, RegistrationNumber};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The ledger confirmed a new attendance record.
    Marked {
        name: String,
        reg_no: RegistrationNumber,
        account: Account,
    },
    /// The resolver returned no candidates for the frame.
    NoFaceDetected,
    /// The candidate is not enrolled (or not bound) in this classroom.
    UnknownStudent {
        name: String,
        reg_no: RegistrationNumber,
    },
    /// The account is already in the session's marked-set; no write issued.
    AlreadyMarked {
        name: String,
        reg_no: RegistrationNumber,
        account: Account,
    },
}

impl AttemptOutcome {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptOutcome::Marked { .. } => "marked",
            AttemptOutcome::NoFaceDetected => "no_face_detected",
            AttemptOutcome::UnknownStudent { .. } => "unknown_student",
            AttemptOutcome::AlreadyMarked { .. } => "already_marked",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("frame capture failed: {0}")]
    Capture(#[from] CaptureError),
    #[error("identity resolution failed: {0}")]
    ResolutionFailed(#[source] ResolverError),
    #[error("directory lookup failed for {reg_no}: {source}")]
    LookupFailed {
        reg_no: RegistrationNumber,
        source: DirectoryError,
    },
    #[error("attendance commit failed for {reg_no}: {reason}")]
    CommitFailed {
        name: String,
        reg_no: RegistrationNumber,
        account: Account,
        #[source]
        reason: LedgerError,
    },
    #[error("attendance session closed")]
    SessionClosed,
}

impl AttemptError {
    pub fn kind(&self) -> &'static str {
        match self {
            AttemptError::Capture(CaptureError::DeviceUnavailable(_)) => "device_unavailable",
            AttemptError::Capture(CaptureError::NotStreaming) => "not_streaming",
            AttemptError::ResolutionFailed(_) => "resolution_failed",
            AttemptError::LookupFailed { .. } => "lookup_failed",
            AttemptError::CommitFailed { .. } => "commit_failed",
            AttemptError::SessionClosed => "session_closed",
        }
    }

    /// Whether re-capturing and re-submitting for the same student may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            AttemptError::CommitFailed { reason, .. } if *reason != LedgerError::AlreadyExists
        )
    }
}

/// Serializable view of an attempt result for operator-facing surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptReport {
    pub kind: &'static str,
    /// `false` for true failures, `true` for normal outcomes.
    pub expected: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reg_no: Option<RegistrationNumber>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<Account>,
    pub retriable: bool,
}

impl From<&Result<AttemptOutcome, AttemptError>> for AttemptReport {
    fn from(result: &Result<AttemptOutcome, AttemptError>) -> Self {
        match result {
            Ok(outcome) => {
                let (name, reg_no, account, message) = match outcome {
                    AttemptOutcome::Marked { name, reg_no, account } => (
                        Some(name.clone()),
                        Some(reg_no.clone()),
                        Some(account.clone()),
                        format!("attendance marked for {name} ({reg_no})"),
                    ),
                    AttemptOutcome::NoFaceDetected => {
                        (None, None, None, "no students detected in this frame".to_string())
                    }
                    AttemptOutcome::UnknownStudent { name, reg_no } => (
                        Some(name.clone()),
                        Some(reg_no.clone()),
                        None,
                        format!("{reg_no} is not enrolled in this classroom"),
                    ),
                    AttemptOutcome::AlreadyMarked { name, reg_no, account } => (
                        Some(name.clone()),
                        Some(reg_no.clone()),
                        Some(account.clone()),
                        format!("{name} ({reg_no}) is already marked"),
                    ),
                };
                AttemptReport {
                    kind: outcome.kind(),
                    expected: true,
                    message,
                    name,
                    reg_no,
                    account,
                    retriable: false,
                }
            }
            Err(err) => {
                let (name, reg_no, account) = match err {
                    AttemptError::CommitFailed { name, reg_no, account, .. } => {
                        (Some(name.clone()), Some(reg_no.clone()), Some(account.clone()))
                    }
                    AttemptError::LookupFailed { reg_no, .. } => (None, Some(reg_no.clone()), None),
                    _ => (None, None, None),
                };
                AttemptReport {
                    kind: err.kind(),
                    expected: false,
                    message: err.to_string(),
                    name,
                    reg_no,
                    account,
                    retriable: err.is_retriable(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_expected_outcomes_are_not_failures() {
        let result: Result<AttemptOutcome, AttemptError> = Ok(AttemptOutcome::NoFaceDetected);
        let report = AttemptReport::from(&result);
        assert!(report.expected);
        assert_eq!(report.kind, "no_face_detected");
        assert!(!report.retriable);
    }

    #[test]
    fn test_commit_failure_is_retriable_unless_already_exists() {
        let timed_out = AttemptError::CommitFailed {
            name: "Alice".into(),
            reg_no: RegistrationNumber::new("R1"),
            account: Account::new("0xAAA"),
            reason: LedgerError::Timeout(Duration::from_secs(30)),
        };
        assert!(timed_out.is_retriable());

        let duplicate = AttemptError::CommitFailed {
            name: "Alice".into(),
            reg_no: RegistrationNumber::new("R1"),
            account: Account::new("0xAAA"),
            reason: LedgerError::AlreadyExists,
        };
        assert!(!duplicate.is_retriable());
    }

    #[test]
    fn test_report_serialization_omits_missing_identity() {
        let result: Result<AttemptOutcome, AttemptError> = Err(AttemptError::ResolutionFailed(
            ResolverError::Unreachable("connection refused".into()),
        ));
        let json = serde_json::to_string(&AttemptReport::from(&result)).unwrap();
        assert!(json.contains("\"kind\":\"resolution_failed\""));
        assert!(json.contains("\"expected\":false"));
        assert!(!json.contains("reg_no"));
    }

    #[test]
    fn test_capture_error_kinds() {
        let err = AttemptError::from(CaptureError::NotStreaming);
        assert_eq!(err.kind(), "not_streaming");
        let err = AttemptError::from(CaptureError::DeviceUnavailable("busy".into()));
        assert_eq!(err.kind(), "device_unavailable");
    }
}
