//! rollcall-core — Face-verified attendance pipeline.
//!
//! Defines the contracts for the identity resolver, directory, ledger and
//! frame source, and the attendance session that drives one classroom's
//! verification-and-commit attempts against them.

pub mod capture;
pub mod directory;
pub mod ledger;
pub mod mock;
pub mod outcome;
pub mod registry;
pub mod resolver;
pub mod session;
pub mod types;

pub use capture::{CaptureError, CaptureState, FrameSource};
pub use directory::{DirectoryError, DirectoryService};
pub use ledger::{AttendanceLedger, LedgerError};
pub use outcome::{AttemptError, AttemptOutcome, AttemptReport};
pub use registry::{ClassroomRegistry, RegistryError};
pub use resolver::{IdentityResolver, ResolverError};
pub use session::{AttemptPhase, AttendanceSession, CallTimeouts, Collaborators, SessionError};
pub use types::{
    Account, Candidate, Classroom, ClassroomId, ImageFormat, MarkedStudent, RegistrationNumber,
    StillImage, Student,
};
