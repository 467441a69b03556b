//! In-memory collaborators for tests and offline runs.
//!
//! [`InMemoryLedger`] plays the registry, directory and ledger at once and
//! enforces the same uniqueness rules a real ledger does. Call counters and
//! fault injection make session behavior observable.

use crate::capture::{CaptureError, CaptureState, FrameSource};
use crate::directory::{DirectoryError, DirectoryService};
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::registry::{validate_label, ClassroomRegistry, RegistryError};
use crate::resolver::{IdentityResolver, ResolverError};
use crate::types::{
    Account, Candidate, Classroom, ClassroomId, ImageFormat, MarkedStudent, RegistrationNumber,
    StillImage, Student,
};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// A tiny placeholder still; its bytes are never decoded by the mocks.
pub fn still(sequence: u32) -> StillImage {
    StillImage {
        data: vec![0xFF, 0xD8, 0xFF, 0xD9],
        format: ImageFormat::Jpeg,
        width: 1,
        height: 1,
        captured_at: Utc::now(),
        sequence,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolver returning scripted responses, cycling through them.
pub struct ScriptedResolver {
    responses: Vec<Result<Vec<Candidate>, ResolverError>>,
    delay: Option<Duration>,
    call_count: AtomicUsize,
}

impl ScriptedResolver {
    /// Always return the same candidates.
    pub fn always(candidates: Vec<Candidate>) -> Self {
        Self::sequence(vec![Ok(candidates)])
    }

    /// Always fail with `error`.
    pub fn failing(error: ResolverError) -> Self {
        Self::sequence(vec![Err(error)])
    }

    /// Return `responses` in order, starting over after the last one.
    pub fn sequence(responses: Vec<Result<Vec<Candidate>, ResolverError>>) -> Self {
        Self {
            responses,
            delay: None,
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityResolver for ScriptedResolver {
    async fn resolve(
        &self,
        _scope: Option<&str>,
        _image: &StillImage,
    ) -> Result<Vec<Candidate>, ResolverError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.responses.is_empty() {
            return Ok(Vec::new());
        }
        self.responses[count % self.responses.len()].clone()
    }
}

struct ClassroomEntry {
    classroom: Classroom,
    students: Vec<Student>,
    marks: Vec<MarkedStudent>,
}

#[derive(Default)]
struct LedgerState {
    classrooms: Vec<ClassroomEntry>,
    commit_delay: Option<Duration>,
    failures: Vec<LedgerError>,
    lookup_delay: Option<Duration>,
    lookup_failures: Vec<DirectoryError>,
    read_delay: Option<Duration>,
}

impl LedgerState {
    fn entry(&self, id: &ClassroomId) -> Option<&ClassroomEntry> {
        self.classrooms.iter().find(|c| &c.classroom.id == id)
    }

    fn entry_mut(&mut self, id: &ClassroomId) -> Option<&mut ClassroomEntry> {
        self.classrooms.iter_mut().find(|c| &c.classroom.id == id)
    }
}

/// Registry, directory and ledger backed by process memory.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    mark_calls: AtomicUsize,
    lookup_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Decrements the in-flight counter even when a commit future is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every ledger write by `delay` before it is applied.
    pub fn set_commit_delay(&self, delay: Duration) {
        lock(&self.state).commit_delay = Some(delay);
    }

    /// Fail the next `count` writes with `error` without applying them.
    pub fn fail_next_commits(&self, count: usize, error: LedgerError) {
        let mut state = lock(&self.state);
        state.failures.extend(std::iter::repeat(error).take(count));
    }

    /// Delay every ledger read by `delay`.
    pub fn set_read_delay(&self, delay: Duration) {
        lock(&self.state).read_delay = Some(delay);
    }

    /// Delay every directory lookup by `delay`.
    pub fn set_lookup_delay(&self, delay: Duration) {
        lock(&self.state).lookup_delay = Some(delay);
    }

    /// Fail the next `count` lookups with `error`.
    pub fn fail_next_lookups(&self, count: usize, error: DirectoryError) {
        let mut state = lock(&self.state);
        state.lookup_failures.extend(std::iter::repeat(error).take(count));
    }

    /// Number of `mark_attendance` calls, including rejected ones.
    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }

    /// Number of directory lookups.
    pub fn lookup_calls(&self) -> usize {
        self.lookup_calls.load(Ordering::SeqCst)
    }

    /// Highest number of writes ever in flight at once.
    pub fn max_in_flight_commits(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn is_marked(&self, classroom: &ClassroomId, account: &Account) -> bool {
        lock(&self.state)
            .entry(classroom)
            .is_some_and(|entry| entry.marks.iter().any(|m| &m.account == account))
    }

    /// Accounts in the order their records were written.
    pub fn commit_log(&self, classroom: &ClassroomId) -> Vec<Account> {
        lock(&self.state)
            .entry(classroom)
            .map(|entry| entry.marks.iter().map(|m| m.account.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClassroomRegistry for InMemoryLedger {
    async fn create_classroom(&self, name: &str) -> Result<Classroom, RegistryError> {
        validate_label("classroom name", name)?;
        let mut state = lock(&self.state);
        if state.classrooms.iter().any(|c| c.classroom.name == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        let classroom = Classroom {
            id: ClassroomId::new(state.classrooms.len().to_string()),
            name: name.to_string(),
        };
        state.classrooms.push(ClassroomEntry {
            classroom: classroom.clone(),
            students: Vec::new(),
            marks: Vec::new(),
        });
        Ok(classroom)
    }

    async fn classrooms(&self) -> Result<Vec<Classroom>, RegistryError> {
        Ok(lock(&self.state)
            .classrooms
            .iter()
            .map(|c| c.classroom.clone())
            .collect())
    }

    async fn add_student(
        &self,
        classroom: &ClassroomId,
        name: &str,
        reg_no: &RegistrationNumber,
    ) -> Result<(), RegistryError> {
        validate_label("student name", name)?;
        validate_label("registration number", reg_no.as_str())?;
        let mut state = lock(&self.state);
        let entry = state
            .entry_mut(classroom)
            .ok_or_else(|| RegistryError::UnknownClassroom(classroom.clone()))?;
        if entry.students.iter().any(|s| &s.reg_no == reg_no) {
            return Err(RegistryError::DuplicateRegNo(reg_no.clone()));
        }
        entry.students.push(Student {
            reg_no: reg_no.clone(),
            name: name.to_string(),
            account: None,
        });
        Ok(())
    }

    async fn bind_account(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
        account: &Account,
    ) -> Result<(), RegistryError> {
        let mut state = lock(&self.state);
        let entry = state
            .entry_mut(classroom)
            .ok_or_else(|| RegistryError::UnknownClassroom(classroom.clone()))?;
        if entry
            .students
            .iter()
            .any(|s| s.account.as_ref() == Some(account) && &s.reg_no != reg_no)
        {
            return Err(RegistryError::AccountInUse(account.clone()));
        }
        let student = entry
            .students
            .iter_mut()
            .find(|s| &s.reg_no == reg_no)
            .ok_or_else(|| RegistryError::UnknownStudent(reg_no.clone()))?;
        student.account = Some(account.clone());
        Ok(())
    }

    async fn students(&self, classroom: &ClassroomId) -> Result<Vec<Student>, RegistryError> {
        lock(&self.state)
            .entry(classroom)
            .map(|entry| entry.students.clone())
            .ok_or_else(|| RegistryError::UnknownClassroom(classroom.clone()))
    }
}

#[async_trait]
impl DirectoryService for InMemoryLedger {
    async fn account_for(
        &self,
        classroom: &ClassroomId,
        reg_no: &RegistrationNumber,
    ) -> Result<Option<Account>, DirectoryError> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        let delay = lock(&self.state).lookup_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if !state.lookup_failures.is_empty() {
            return Err(state.lookup_failures.remove(0));
        }
        Ok(state.entry(classroom).and_then(|entry| {
            entry
                .students
                .iter()
                .find(|s| &s.reg_no == reg_no)
                .and_then(|s| s.account.clone())
        }))
    }
}

#[async_trait]
impl AttendanceLedger for InMemoryLedger {
    async fn marked_students(
        &self,
        classroom: &ClassroomId,
    ) -> Result<Vec<MarkedStudent>, LedgerError> {
        let delay = lock(&self.state).read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state)
            .entry(classroom)
            .map(|entry| entry.marks.clone())
            .ok_or_else(|| LedgerError::UnknownClassroom(classroom.clone()))
    }

    async fn mark_attendance(
        &self,
        classroom: &ClassroomId,
        account: &Account,
    ) -> Result<(), LedgerError> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = lock(&self.state).commit_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if !state.failures.is_empty() {
            return Err(state.failures.remove(0));
        }
        let entry = state
            .entry_mut(classroom)
            .ok_or_else(|| LedgerError::UnknownClassroom(classroom.clone()))?;
        let reg_no = entry
            .students
            .iter()
            .find(|s| s.account.as_ref() == Some(account))
            .map(|s| s.reg_no.clone())
            .ok_or_else(|| LedgerError::Rejected(format!("{account} is not enrolled")))?;
        if entry.marks.iter().any(|m| &m.account == account) {
            return Err(LedgerError::AlreadyExists);
        }
        entry.marks.push(MarkedStudent {
            account: account.clone(),
            reg_no: Some(reg_no),
            marked_at: Some(Utc::now()),
        });
        Ok(())
    }
}

/// Frame source serving placeholder stills while started.
#[derive(Default)]
pub struct StaticFrameSource {
    state: Mutex<CaptureState>,
    served: AtomicUsize,
}

impl StaticFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSource for StaticFrameSource {
    async fn start(&self) -> Result<(), CaptureError> {
        *lock(&self.state) = CaptureState::Streaming;
        Ok(())
    }

    async fn stop(&self) {
        *lock(&self.state) = CaptureState::Idle;
    }

    async fn capture_frame(&self) -> Result<StillImage, CaptureError> {
        if *lock(&self.state) != CaptureState::Streaming {
            return Err(CaptureError::NotStreaming);
        }
        let seq = self.served.fetch_add(1, Ordering::SeqCst);
        Ok(still(seq as u32))
    }

    async fn state(&self) -> CaptureState {
        *lock(&self.state)
    }
}
