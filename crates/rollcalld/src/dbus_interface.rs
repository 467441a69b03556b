use rollcall_core::{
    AttemptReport, AttendanceSession, CallTimeouts, ClassroomId, ClassroomRegistry, Collaborators,
    FrameSource, RegistrationNumber, RegistryError, SessionError,
};
use rollcall_core::{Account, LedgerError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// At most one attendance session is live at a time; it owns the camera
/// from `StartSession` until `StopSession`. The session slot is only locked
/// for short reads and swaps, never across camera or ledger calls.
pub struct AttendanceService {
    camera: Arc<dyn FrameSource>,
    device: String,
    registry: Arc<dyn ClassroomRegistry>,
    collaborators: Collaborators,
    timeouts: CallTimeouts,
    session: Mutex<Option<AttendanceSession>>,
    starting: AtomicBool,
}

/// Clears the `starting` flag when `StartSession` returns or is dropped.
struct StartingGuard<'a>(&'a AtomicBool);

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl AttendanceService {
    pub fn new(
        camera: Arc<dyn FrameSource>,
        device: impl Into<String>,
        registry: Arc<dyn ClassroomRegistry>,
        collaborators: Collaborators,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            camera,
            device: device.into(),
            registry,
            collaborators,
            timeouts,
            session: Mutex::new(None),
            starting: AtomicBool::new(false),
        }
    }

    /// Close the live session (if any) and release the camera.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
        self.camera.stop().await;
    }

    async fn active(&self) -> fdo::Result<AttendanceSession> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| fdo::Error::Failed("no attendance session is running".into()))
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn registry_error(err: RegistryError) -> fdo::Error {
    match err {
        RegistryError::InvalidInput(_)
        | RegistryError::UnknownClassroom(_)
        | RegistryError::UnknownStudent(_) => fdo::Error::InvalidArgs(err.to_string()),
        _ => fdo::Error::Failed(err.to_string()),
    }
}

fn ledger_error(err: LedgerError) -> fdo::Error {
    match err {
        LedgerError::UnknownClassroom(_) => fdo::Error::InvalidArgs(err.to_string()),
        _ => fdo::Error::Failed(err.to_string()),
    }
}

fn session_error(err: SessionError) -> fdo::Error {
    match err {
        SessionError::Seed(LedgerError::UnknownClassroom(_)) => fdo::Error::InvalidArgs(err.to_string()),
        _ => fdo::Error::Failed(err.to_string()),
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Create a classroom. Returns the classroom as JSON.
    async fn create_classroom(&self, name: &str) -> fdo::Result<String> {
        tracing::info!(name, "create_classroom requested");
        let classroom = self.registry.create_classroom(name).await.map_err(registry_error)?;
        to_json(&classroom)
    }

    /// List classrooms as a JSON array.
    async fn list_classrooms(&self) -> fdo::Result<String> {
        let classrooms = self.registry.classrooms().await.map_err(registry_error)?;
        to_json(&classrooms)
    }

    async fn add_student(&self, classroom_id: &str, name: &str, reg_no: &str) -> fdo::Result<()> {
        tracing::info!(classroom_id, reg_no, "add_student requested");
        self.registry
            .add_student(&ClassroomId::new(classroom_id), name, &RegistrationNumber::new(reg_no))
            .await
            .map_err(registry_error)
    }

    async fn bind_account(&self, classroom_id: &str, reg_no: &str, account: &str) -> fdo::Result<()> {
        tracing::info!(classroom_id, reg_no, account, "bind_account requested");
        self.registry
            .bind_account(
                &ClassroomId::new(classroom_id),
                &RegistrationNumber::new(reg_no),
                &Account::new(account),
            )
            .await
            .map_err(registry_error)
    }

    /// Start capture and open a session for the classroom.
    /// Returns `{session, classroom, name, already_marked}` as JSON.
    async fn start_session(&self, classroom_id: &str) -> fdo::Result<String> {
        tracing::info!(classroom_id, "start_session requested");
        let _starting = {
            let slot = self.session.lock().await;
            if let Some(live) = slot.as_ref() {
                return Err(fdo::Error::Failed(format!(
                    "session {} already running for classroom {}",
                    live.id(),
                    live.classroom().id
                )));
            }
            if self.starting.swap(true, Ordering::SeqCst) {
                return Err(fdo::Error::Failed("a session is already starting".into()));
            }
            StartingGuard(&self.starting)
        };

        let classroom = self
            .registry
            .classroom(&ClassroomId::new(classroom_id))
            .await
            .map_err(registry_error)?
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("unknown classroom: {classroom_id}")))?;

        self.camera
            .start()
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;

        let opened = AttendanceSession::open(
            classroom,
            self.collaborators.clone(),
            Some(self.camera.clone()),
            self.timeouts,
        )
        .await;
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                self.camera.stop().await;
                return Err(session_error(e));
            }
        };

        let already_marked = session.marked().await.map_err(session_error)?.len();
        let reply = serde_json::json!({
            "session": session.id().to_string(),
            "classroom": session.classroom().id,
            "name": session.classroom().name,
            "already_marked": already_marked,
        });
        *self.session.lock().await = Some(session);
        Ok(reply.to_string())
    }

    /// Close the live session and release the camera. Returns `false` if no
    /// session was running.
    async fn stop_session(&self) -> fdo::Result<bool> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(false);
        };
        tracing::info!(session = %session.id(), "stop_session requested");
        session.close().await;
        self.camera.stop().await;
        Ok(true)
    }

    /// Capture one still and run a verification-and-commit attempt on it.
    /// Returns the attempt report as JSON; failures are reported in-band.
    async fn capture(&self) -> fdo::Result<String> {
        let session = self.active().await?;
        let result = session.capture_and_submit().await;
        to_json(&AttemptReport::from(&result))
    }

    /// Ledger records for a classroom, or for the live session's classroom
    /// when `classroom_id` is empty.
    async fn marked(&self, classroom_id: &str) -> fdo::Result<String> {
        let classroom = if classroom_id.is_empty() {
            self.active().await?.classroom().id.clone()
        } else {
            ClassroomId::new(classroom_id)
        };
        let records = self
            .collaborators
            .ledger
            .marked_students(&classroom)
            .await
            .map_err(ledger_error)?;
        to_json(&records)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let session = self.session.lock().await.clone();
        let session = session.map(|s| {
            serde_json::json!({
                "id": s.id().to_string(),
                "classroom": s.classroom().id,
                "name": s.classroom().name,
                "phase": s.phase(),
            })
        });
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera.state().await,
            "device": self.device,
            "session": session,
            "starting": self.starting.load(Ordering::SeqCst),
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::mock::{InMemoryLedger, ScriptedResolver, StaticFrameSource};
    use rollcall_core::{Candidate, CaptureState};
    use std::time::Duration;

    struct Fixture {
        service: AttendanceService,
        camera: Arc<StaticFrameSource>,
        ledger: Arc<InMemoryLedger>,
    }

    async fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let camera = Arc::new(StaticFrameSource::new());
        let collaborators = Collaborators {
            resolver: Arc::new(ScriptedResolver::always(vec![Candidate::new("Alice", "R1")])),
            directory: ledger.clone(),
            ledger: ledger.clone(),
        };
        let service = AttendanceService::new(
            camera.clone(),
            "test://camera",
            ledger.clone(),
            collaborators,
            CallTimeouts::default(),
        );
        Fixture {
            service,
            camera,
            ledger,
        }
    }

    async fn enroll_math(fx: &Fixture) -> String {
        let json = fx.service.create_classroom("Math101").await.unwrap();
        let classroom: serde_json::Value = serde_json::from_str(&json).unwrap();
        let id = classroom["id"].as_str().unwrap().to_string();
        fx.service.add_student(&id, "Alice", "R1").await.unwrap();
        fx.service.bind_account(&id, "R1", "0xAAA").await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let fx = fixture().await;
        let math = enroll_math(&fx).await;

        let started: serde_json::Value =
            serde_json::from_str(&fx.service.start_session(&math).await.unwrap()).unwrap();
        assert_eq!(started["already_marked"], 0);
        assert_eq!(fx.camera.state().await, CaptureState::Streaming);

        let first: serde_json::Value = serde_json::from_str(&fx.service.capture().await.unwrap()).unwrap();
        assert_eq!(first["kind"], "marked");
        assert_eq!(first["expected"], true);

        let second: serde_json::Value = serde_json::from_str(&fx.service.capture().await.unwrap()).unwrap();
        assert_eq!(second["kind"], "already_marked");
        assert_eq!(fx.ledger.mark_calls(), 1);

        let marked: serde_json::Value = serde_json::from_str(&fx.service.marked("").await.unwrap()).unwrap();
        assert_eq!(marked[0]["account"], "0xAAA");

        assert!(fx.service.stop_session().await.unwrap());
        assert_eq!(fx.camera.state().await, CaptureState::Idle);
        assert!(!fx.service.stop_session().await.unwrap());
    }

    #[tokio::test]
    async fn test_second_session_refused() {
        let fx = fixture().await;
        let math = enroll_math(&fx).await;
        fx.service.start_session(&math).await.unwrap();
        assert!(matches!(
            fx.service.start_session(&math).await,
            Err(fdo::Error::Failed(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_answers_while_session_starts() {
        let fx = fixture().await;
        let math = enroll_math(&fx).await;
        fx.ledger.set_read_delay(Duration::from_secs(20));
        let service = Arc::new(fx.service);

        let starting = {
            let service = service.clone();
            let math = math.clone();
            tokio::spawn(async move { service.start_session(&math).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = tokio::time::timeout(Duration::from_millis(100), service.status())
            .await
            .expect("status blocked behind start_session")
            .unwrap();
        let status: serde_json::Value = serde_json::from_str(&status).unwrap();
        assert_eq!(status["starting"], true);
        assert!(status["session"].is_null());
        assert!(matches!(
            service.start_session(&math).await,
            Err(fdo::Error::Failed(_))
        ));

        starting.await.unwrap().unwrap();
        let status: serde_json::Value = serde_json::from_str(&service.status().await.unwrap()).unwrap();
        assert_eq!(status["starting"], false);
        assert_eq!(status["session"]["classroom"], math);
    }

    #[tokio::test]
    async fn test_unknown_classroom_is_invalid_args() {
        let fx = fixture().await;
        assert!(matches!(
            fx.service.start_session("99").await,
            Err(fdo::Error::InvalidArgs(_))
        ));
        assert_eq!(fx.camera.state().await, CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_capture_without_session_fails() {
        let fx = fixture().await;
        assert!(fx.service.capture().await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_classroom_reported() {
        let fx = fixture().await;
        enroll_math(&fx).await;
        assert!(matches!(
            fx.service.create_classroom("Math101").await,
            Err(fdo::Error::Failed(_))
        ));
    }

    #[tokio::test]
    async fn test_status_reports_session() {
        let fx = fixture().await;
        let math = enroll_math(&fx).await;
        fx.service.start_session(&math).await.unwrap();

        let status: serde_json::Value = serde_json::from_str(&fx.service.status().await.unwrap()).unwrap();
        assert_eq!(status["camera"], "streaming");
        assert_eq!(status["session"]["classroom"], math);
        assert_eq!(status["session"]["phase"], "idle");

        fx.service.shutdown().await;
        let status: serde_json::Value = serde_json::from_str(&fx.service.status().await.unwrap()).unwrap();
        assert!(status["session"].is_null());
    }
}
