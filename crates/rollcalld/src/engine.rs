use async_trait::async_trait;
use rollcall_core::{CaptureError, CaptureState, FrameSource, StillImage};
use rollcall_hw::CaptureController;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Messages sent from async callers to the capture thread.
enum EngineRequest {
    Start {
        reply: oneshot::Sender<Result<(), CaptureError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Capture {
        reply: oneshot::Sender<Result<StillImage, CaptureError>>,
    },
    State {
        reply: oneshot::Sender<CaptureState>,
    },
}

/// Clone-safe handle to the capture thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

fn engine_gone() -> CaptureError {
    CaptureError::DeviceUnavailable("capture engine exited".to_string())
}

#[async_trait]
impl FrameSource for EngineHandle {
    async fn start(&self) -> Result<(), CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Start { reply })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn capture_frame(&self) -> Result<StillImage, CaptureError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Capture { reply })
            .await
            .map_err(|_| engine_gone())?;
        rx.await.map_err(|_| engine_gone())?
    }

    async fn state(&self) -> CaptureState {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(EngineRequest::State { reply }).await.is_err() {
            return CaptureState::Idle;
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawn the capture controller on a dedicated OS thread.
///
/// Device I/O is blocking, so the controller never runs on the async
/// runtime. The camera is not opened until the first `start`.
pub fn spawn_engine(mut controller: CaptureController) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);
    let device = controller.device_path().to_string();

    std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || {
            tracing::info!(device = %device, "capture thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Start { reply } => {
                        let _ = reply.send(controller.start());
                    }
                    EngineRequest::Stop { reply } => {
                        controller.stop();
                        let _ = reply.send(());
                    }
                    EngineRequest::Capture { reply } => {
                        let _ = reply.send(controller.capture_frame());
                    }
                    EngineRequest::State { reply } => {
                        let _ = reply.send(controller.state());
                    }
                }
            }
            controller.stop();
            tracing::info!(device = %device, "capture thread exiting");
        })?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_hw::{StillEncoding, SyntheticBackend};

    fn synthetic_engine(path: &str) -> EngineHandle {
        let controller = CaptureController::new(
            Box::new(SyntheticBackend::default()),
            path,
            StillEncoding::default(),
            0,
        );
        spawn_engine(controller).unwrap()
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let engine = synthetic_engine("engine://lifecycle");
        assert_eq!(engine.state().await, CaptureState::Idle);
        assert_eq!(engine.capture_frame().await.unwrap_err(), CaptureError::NotStreaming);

        engine.start().await.unwrap();
        assert_eq!(engine.state().await, CaptureState::Streaming);
        let still = engine.capture_frame().await.unwrap();
        assert!(!still.is_empty());

        engine.stop().await;
        assert_eq!(engine.state().await, CaptureState::Idle);
    }

    #[tokio::test]
    async fn test_two_engines_cannot_share_a_device() {
        let first = synthetic_engine("engine://shared");
        let second = synthetic_engine("engine://shared");

        first.start().await.unwrap();
        assert!(matches!(
            second.start().await,
            Err(CaptureError::DeviceUnavailable(_))
        ));
        first.stop().await;
        second.start().await.unwrap();
        second.stop().await;
    }
}
