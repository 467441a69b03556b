//! Attendance session: one classroom's live-marking state machine.
//!
//! A session owns a worker task that processes capture attempts strictly in
//! submission order. Each attempt walks the phases in [`AttemptPhase`] and
//! ends in an [`AttemptOutcome`] or [`AttemptError`], after which the worker
//! is back to awaiting the next capture. Callers talk to the worker through a
//! cloneable [`AttendanceSession`] handle; dropping a caller's future does not
//! abort an attempt the worker has already picked up.

use crate::capture::{CaptureError, FrameSource};
use crate::directory::{DirectoryError, DirectoryService};
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::outcome::{AttemptError, AttemptOutcome, AttemptReport};
use crate::resolver::{IdentityResolver, ResolverError};
use crate::types::{Account, Classroom, StillImage};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Default ceiling for a resolver call.
pub const DEFAULT_RESOLVER_TIMEOUT: Duration = Duration::from_secs(10);
/// Default ceiling for a directory lookup.
pub const DEFAULT_DIRECTORY_TIMEOUT: Duration = Duration::from_secs(5);
/// Default ceiling for a ledger read or write (includes confirmation).
pub const DEFAULT_LEDGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue depth for pending attempts.
const SESSION_QUEUE_DEPTH: usize = 8;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("failed to seed marked set from ledger: {0}")]
    Seed(#[source] LedgerError),
    #[error("failed to refresh marked set from ledger: {0}")]
    Resync(#[source] LedgerError),
    #[error("attendance session closed")]
    Closed,
}

/// Independent per-call timeouts for the external collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    pub resolver: Duration,
    pub directory: Duration,
    pub ledger: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            resolver: DEFAULT_RESOLVER_TIMEOUT,
            directory: DEFAULT_DIRECTORY_TIMEOUT,
            ledger: DEFAULT_LEDGER_TIMEOUT,
        }
    }
}

/// Injected handles to the external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub resolver: Arc<dyn IdentityResolver>,
    pub directory: Arc<dyn DirectoryService>,
    pub ledger: Arc<dyn AttendanceLedger>,
}

/// Where the worker currently is within one attempt.
///
/// `Idle` is "awaiting next capture"; terminal states are reported through
/// the attempt result and immediately fall back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptPhase {
    Idle,
    Captured,
    Resolving,
    Resolved,
    DirectoryLookup,
    Found,
    LocalCheck,
    NotMarked,
    Committing,
}

type AttemptResult = Result<AttemptOutcome, AttemptError>;

/// Messages sent from session handles to the worker task.
enum SessionRequest {
    Submit {
        frame: StillImage,
        reply: oneshot::Sender<AttemptResult>,
    },
    CaptureAndSubmit {
        reply: oneshot::Sender<AttemptResult>,
    },
    Resync {
        reply: oneshot::Sender<Result<usize, LedgerError>>,
    },
    Marked {
        reply: oneshot::Sender<Vec<Account>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Clone-safe handle to a running attendance session.
#[derive(Clone)]
pub struct AttendanceSession {
    id: Uuid,
    classroom: Classroom,
    tx: mpsc::Sender<SessionRequest>,
    phase: watch::Receiver<AttemptPhase>,
}

impl AttendanceSession {
    /// Seed the marked-set from the ledger and spawn the session worker.
    ///
    /// `capture` is the session's frame source; without one only
    /// [`submit_frame`](Self::submit_frame) is usable.
    pub async fn open(
        classroom: Classroom,
        collaborators: Collaborators,
        capture: Option<Arc<dyn FrameSource>>,
        timeouts: CallTimeouts,
    ) -> Result<Self, SessionError> {
        let id = Uuid::new_v4();
        let marked = bounded(
            timeouts.ledger,
            collaborators.ledger.marked_accounts(&classroom.id),
            LedgerError::Timeout,
        )
        .await
        .map_err(SessionError::Seed)?;

        tracing::info!(
            session = %id,
            classroom = %classroom.id,
            name = %classroom.name,
            already_marked = marked.len(),
            "attendance session opened"
        );

        let (phase_tx, phase_rx) = watch::channel(AttemptPhase::Idle);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);

        let worker = SessionWorker {
            id,
            classroom: classroom.clone(),
            collaborators,
            capture,
            timeouts,
            marked,
            phase: phase_tx,
        };
        tokio::spawn(worker.run(rx));

        Ok(Self {
            id,
            classroom,
            tx,
            phase: phase_rx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn classroom(&self) -> &Classroom {
        &self.classroom
    }

    /// Current phase of the attempt being processed, `Idle` between attempts.
    pub fn phase(&self) -> AttemptPhase {
        *self.phase.borrow()
    }

    /// Observe phase transitions.
    pub fn subscribe_phase(&self) -> watch::Receiver<AttemptPhase> {
        self.phase.clone()
    }

    /// Run one verification-and-commit attempt for an already captured frame.
    pub async fn submit_frame(&self, frame: StillImage) -> AttemptResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Submit { frame, reply })
            .await
            .map_err(|_| AttemptError::SessionClosed)?;
        rx.await.map_err(|_| AttemptError::SessionClosed)?
    }

    /// Pull a frame from the session's frame source, then submit it.
    pub async fn capture_and_submit(&self) -> AttemptResult {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::CaptureAndSubmit { reply })
            .await
            .map_err(|_| AttemptError::SessionClosed)?;
        rx.await.map_err(|_| AttemptError::SessionClosed)?
    }

    /// Re-read the ledger and merge it into the local marked-set.
    /// Returns the size of the marked-set afterwards.
    pub async fn resync(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Resync { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::Resync)
    }

    /// Snapshot of the accounts this session has observed as marked.
    pub async fn marked(&self) -> Result<Vec<Account>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SessionRequest::Marked { reply })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop accepting attempts once everything queued before this call has
    /// finished. Later calls on any handle fail with `SessionClosed`.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(SessionRequest::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Session state owned by the worker task.
struct SessionWorker {
    id: Uuid,
    classroom: Classroom,
    collaborators: Collaborators,
    capture: Option<Arc<dyn FrameSource>>,
    timeouts: CallTimeouts,
    marked: HashSet<Account>,
    phase: watch::Sender<AttemptPhase>,
}

impl SessionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionRequest>) {
        // Buffered requests are still drained after every handle is dropped.
        while let Some(req) = rx.recv().await {
            match req {
                SessionRequest::Submit { frame, reply } => {
                    let result = self.attempt(frame).await;
                    let _ = reply.send(result);
                }
                SessionRequest::CaptureAndSubmit { reply } => {
                    let result = match self.capture().await {
                        Ok(frame) => self.attempt(frame).await,
                        Err(err) => {
                            tracing::warn!(session = %self.id, error = %err, "capture failed");
                            Err(err.into())
                        }
                    };
                    let _ = reply.send(result);
                }
                SessionRequest::Resync { reply } => {
                    let _ = reply.send(self.resync().await);
                }
                SessionRequest::Marked { reply } => {
                    let mut accounts: Vec<Account> = self.marked.iter().cloned().collect();
                    accounts.sort();
                    let _ = reply.send(accounts);
                }
                SessionRequest::Close { reply } => {
                    rx.close();
                    while let Ok(req) = rx.try_recv() {
                        Self::reject(req);
                    }
                    let _ = reply.send(());
                    break;
                }
            }
        }
        tracing::info!(session = %self.id, classroom = %self.classroom.id, "attendance session closed");
    }

    /// Answer a request that arrived after `close`.
    fn reject(req: SessionRequest) {
        match req {
            SessionRequest::Submit { reply, .. } | SessionRequest::CaptureAndSubmit { reply } => {
                let _ = reply.send(Err(AttemptError::SessionClosed));
            }
            SessionRequest::Resync { reply } => drop(reply),
            SessionRequest::Marked { reply } => drop(reply),
            SessionRequest::Close { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn capture(&self) -> Result<StillImage, CaptureError> {
        match &self.capture {
            Some(source) => source.capture_frame().await,
            None => Err(CaptureError::NotStreaming),
        }
    }

    async fn resync(&mut self) -> Result<usize, LedgerError> {
        let accounts = bounded(
            self.timeouts.ledger,
            self.collaborators.ledger.marked_accounts(&self.classroom.id),
            LedgerError::Timeout,
        )
        .await?;
        self.marked.extend(accounts);
        tracing::debug!(session = %self.id, marked = self.marked.len(), "marked set refreshed");
        Ok(self.marked.len())
    }

    async fn attempt(&mut self, frame: StillImage) -> AttemptResult {
        let sequence = frame.sequence;
        let result = self.drive(frame).await;
        self.enter(AttemptPhase::Idle);

        let report = AttemptReport::from(&result);
        if report.expected {
            tracing::info!(
                session = %self.id,
                classroom = %self.classroom.id,
                frame = sequence,
                outcome = report.kind,
                reg_no = ?report.reg_no,
                account = ?report.account,
                "attempt finished"
            );
        } else {
            tracing::warn!(
                session = %self.id,
                classroom = %self.classroom.id,
                frame = sequence,
                outcome = report.kind,
                reg_no = ?report.reg_no,
                error = %report.message,
                "attempt failed"
            );
        }
        result
    }

    /// One pass through the attempt state machine. The frame is consumed
    /// here and never reused.
    async fn drive(&mut self, frame: StillImage) -> AttemptResult {
        self.enter(AttemptPhase::Captured);

        self.enter(AttemptPhase::Resolving);
        let candidates = bounded(
            self.timeouts.resolver,
            self.collaborators
                .resolver
                .resolve(Some(self.classroom.name.as_str()), &frame),
            ResolverError::Timeout,
        )
        .await
        .map_err(AttemptError::ResolutionFailed)?;
        drop(frame);

        // Only the best guess is considered.
        let Some(candidate) = candidates.into_iter().next() else {
            return Ok(AttemptOutcome::NoFaceDetected);
        };
        self.enter(AttemptPhase::Resolved);
        let name = candidate.display_name;
        let reg_no = candidate.registration_number;

        self.enter(AttemptPhase::DirectoryLookup);
        let account = bounded(
            self.timeouts.directory,
            self.collaborators
                .directory
                .account_for(&self.classroom.id, &reg_no),
            DirectoryError::Timeout,
        )
        .await
        .map_err(|source| AttemptError::LookupFailed {
            reg_no: reg_no.clone(),
            source,
        })?;
        let Some(account) = account else {
            return Ok(AttemptOutcome::UnknownStudent { name, reg_no });
        };
        self.enter(AttemptPhase::Found);

        self.enter(AttemptPhase::LocalCheck);
        if self.marked.contains(&account) {
            return Ok(AttemptOutcome::AlreadyMarked { name, reg_no, account });
        }
        self.enter(AttemptPhase::NotMarked);

        self.enter(AttemptPhase::Committing);
        let committed = bounded(
            self.timeouts.ledger,
            self.collaborators
                .ledger
                .mark_attendance(&self.classroom.id, &account),
            LedgerError::Timeout,
        )
        .await;

        match committed {
            Ok(()) => {
                self.marked.insert(account.clone());
                Ok(AttemptOutcome::Marked { name, reg_no, account })
            }
            Err(reason) => {
                // The ledger itself vouches for an existing record, so the
                // local set may converge on it; any other failure leaves it alone.
                if reason == LedgerError::AlreadyExists {
                    self.marked.insert(account.clone());
                }
                Err(AttemptError::CommitFailed {
                    name,
                    reg_no,
                    account,
                    reason,
                })
            }
        }
    }

    fn enter(&self, phase: AttemptPhase) {
        self.phase.send_replace(phase);
    }
}

/// Await `fut` for at most `limit`, mapping expiry to the caller's error kind.
async fn bounded<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}
