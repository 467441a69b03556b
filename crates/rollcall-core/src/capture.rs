//! Frame source contract consumed by the attendance session.

use crate::types::StillImage;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// No device, no permission, or the device is held by another controller.
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("camera is not streaming")]
    NotStreaming,
}

/// Lifecycle state of a capture controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Starting,
    Streaming,
}

/// Something that can produce encoded still frames on demand.
///
/// `start` is a no-op when already streaming; `stop` always succeeds.
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn start(&self) -> Result<(), CaptureError>;

    async fn stop(&self);

    async fn capture_frame(&self) -> Result<StillImage, CaptureError>;

    async fn state(&self) -> CaptureState;
}
