//! Capture controller: camera lifecycle and still sampling.
//!
//! `Idle -> Starting -> Streaming -> Idle`. A device path can be held by at
//! most one controller in the process at a time; the claim is a
//! [`DeviceLease`] released on `stop` or drop.

use crate::camera::{CameraBackend, CameraError, FrameGrabber};
use crate::frame::{encode_still, Frame, StillEncoding};
use rollcall_core::{CaptureError, CaptureState, StillImage};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Buffers sampled per still before settling for a dark one.
const MAX_DARK_RETRIES: usize = 3;

static CLAIMED_DEVICES: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

fn claimed_devices() -> &'static Mutex<HashSet<String>> {
    CLAIMED_DEVICES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Exclusive, process-wide claim on a device path.
#[derive(Debug)]
pub struct DeviceLease {
    path: String,
}

impl DeviceLease {
    /// Returns `None` if another lease already holds `path`.
    pub fn claim(path: &str) -> Option<Self> {
        let mut claimed = claimed_devices()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if claimed.insert(path.to_string()) {
            Some(Self {
                path: path.to_string(),
            })
        } else {
            None
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        let mut claimed = claimed_devices()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.remove(&self.path);
    }
}

struct ActiveDevice {
    grabber: Box<dyn FrameGrabber>,
    _lease: DeviceLease,
}

/// Owns one camera device and produces encoded stills on demand.
pub struct CaptureController {
    backend: Box<dyn CameraBackend>,
    device_path: String,
    encoding: StillEncoding,
    warmup_frames: usize,
    state: CaptureState,
    active: Option<ActiveDevice>,
}

impl CaptureController {
    pub fn new(
        backend: Box<dyn CameraBackend>,
        device_path: impl Into<String>,
        encoding: StillEncoding,
        warmup_frames: usize,
    ) -> Self {
        Self {
            backend,
            device_path: device_path.into(),
            encoding,
            warmup_frames,
            state: CaptureState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Acquire the device. No-op if already started.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state != CaptureState::Idle {
            tracing::debug!(device = %self.device_path, state = ?self.state, "start ignored");
            return Ok(());
        }

        self.state = CaptureState::Starting;
        match self.acquire() {
            Ok(active) => {
                self.active = Some(active);
                self.state = CaptureState::Streaming;
                tracing::info!(device = %self.device_path, "capture streaming");
                Ok(())
            }
            Err(err) => {
                self.state = CaptureState::Idle;
                tracing::warn!(device = %self.device_path, error = %err, "capture start failed");
                Err(err)
            }
        }
    }

    fn acquire(&self) -> Result<ActiveDevice, CaptureError> {
        let lease = DeviceLease::claim(&self.device_path).ok_or_else(|| {
            CaptureError::DeviceUnavailable(format!(
                "{} is held by another capture controller",
                self.device_path
            ))
        })?;

        let mut grabber = self
            .backend
            .open(&self.device_path)
            .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

        // Let auto-exposure settle.
        if self.warmup_frames > 0 {
            tracing::debug!(count = self.warmup_frames, "discarding warmup frames");
            for n in 0..self.warmup_frames {
                if let Err(e) = grabber.grab() {
                    tracing::debug!(device = %self.device_path, frame = n, error = %e, "warmup grab failed");
                }
            }
        }

        Ok(ActiveDevice {
            grabber,
            _lease: lease,
        })
    }

    /// Release the device. Always succeeds.
    pub fn stop(&mut self) {
        if self.active.take().is_some() {
            tracing::info!(device = %self.device_path, "capture stopped");
        }
        self.state = CaptureState::Idle;
    }

    /// Sample the current video buffer into an encoded still.
    pub fn capture_frame(&mut self) -> Result<StillImage, CaptureError> {
        let Some(active) = self.active.as_mut() else {
            return Err(CaptureError::NotStreaming);
        };

        let frame = grab_lit_frame(active.grabber.as_mut()).map_err(|e| {
            CaptureError::DeviceUnavailable(format!("{}: {e}", self.device_path))
        })?;

        let still = encode_still(&frame, self.encoding)
            .map_err(|e| CaptureError::DeviceUnavailable(format!("{}: {e}", self.device_path)))?;

        tracing::debug!(
            device = %self.device_path,
            sequence = still.sequence,
            bytes = still.len(),
            format = ?still.format,
            "still captured"
        );
        Ok(still)
    }
}

/// Grab up to [`MAX_DARK_RETRIES`] buffers, returning the first non-dark one
/// (or the last one if all are dark).
fn grab_lit_frame(grabber: &mut dyn FrameGrabber) -> Result<Frame, CameraError> {
    let mut frame = grabber.grab()?;
    for _ in 1..MAX_DARK_RETRIES {
        if !frame.is_dark {
            break;
        }
        tracing::debug!(seq = frame.sequence, "skipping dark frame");
        frame = grabber.grab()?;
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn controller(path: &str) -> CaptureController {
        CaptureController::new(Box::new(SyntheticBackend::default()), path, StillEncoding::default(), 2)
    }

    struct FailingBackend;

    impl CameraBackend for FailingBackend {
        fn open(&self, device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError> {
            Err(CameraError::PermissionDenied(device_path.to_string()))
        }
    }

    /// Emits `dark` dark frames before lit ones, counting grabs.
    struct DimBackend {
        dark: usize,
        grabs: Arc<AtomicUsize>,
    }

    struct DimCamera {
        dark: usize,
        grabs: Arc<AtomicUsize>,
    }

    impl CameraBackend for DimBackend {
        fn open(&self, _device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError> {
            Ok(Box::new(DimCamera {
                dark: self.dark,
                grabs: self.grabs.clone(),
            }))
        }
    }

    impl FrameGrabber for DimCamera {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            let n = self.grabs.fetch_add(1, Ordering::SeqCst);
            let is_dark = n < self.dark;
            Ok(Frame {
                data: vec![if is_dark { 0 } else { 128 }; 16],
                width: 4,
                height: 4,
                sequence: n as u32,
                is_dark,
            })
        }
    }

    /// Opens fine, then fails every grab.
    struct BrokenBackend {
        grabs: Arc<AtomicUsize>,
    }

    struct BrokenCamera {
        grabs: Arc<AtomicUsize>,
    }

    impl CameraBackend for BrokenBackend {
        fn open(&self, _device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError> {
            Ok(Box::new(BrokenCamera {
                grabs: self.grabs.clone(),
            }))
        }
    }

    impl FrameGrabber for BrokenCamera {
        fn grab(&mut self) -> Result<Frame, CameraError> {
            self.grabs.fetch_add(1, Ordering::SeqCst);
            Err(CameraError::Io("VIDIOC_DQBUF: No such device".into()))
        }
    }

    #[test]
    fn test_capture_before_start_is_not_streaming() {
        let mut ctl = controller("test://not-started");
        assert_eq!(ctl.capture_frame().unwrap_err(), CaptureError::NotStreaming);
        assert_eq!(ctl.state(), CaptureState::Idle);
    }

    #[test]
    fn test_start_capture_stop_cycle() {
        let mut ctl = controller("test://cycle");
        ctl.start().unwrap();
        assert_eq!(ctl.state(), CaptureState::Streaming);

        let still = ctl.capture_frame().unwrap();
        assert_eq!(&still.data[..2], &[0xFF, 0xD8]);
        // Two warmup frames were discarded.
        assert_eq!(still.sequence, 2);

        ctl.stop();
        assert_eq!(ctl.state(), CaptureState::Idle);
        assert_eq!(ctl.capture_frame().unwrap_err(), CaptureError::NotStreaming);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let mut ctl = controller("test://idempotent");
        ctl.stop();
        ctl.start().unwrap();
        ctl.start().unwrap();
        assert_eq!(ctl.state(), CaptureState::Streaming);
        ctl.stop();
        ctl.stop();
        assert_eq!(ctl.state(), CaptureState::Idle);
    }

    #[test]
    fn test_device_is_exclusive() {
        let mut first = controller("test://exclusive");
        let mut second = controller("test://exclusive");

        first.start().unwrap();
        assert!(matches!(second.start(), Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(second.state(), CaptureState::Idle);

        first.stop();
        second.start().unwrap();
        assert_eq!(second.state(), CaptureState::Streaming);
    }

    #[test]
    fn test_lease_released_on_drop() {
        {
            let mut ctl = controller("test://dropped");
            ctl.start().unwrap();
        }
        assert!(DeviceLease::claim("test://dropped").is_some());
    }

    #[test]
    fn test_open_failure_returns_to_idle_and_releases() {
        let mut ctl = CaptureController::new(
            Box::new(FailingBackend),
            "test://denied",
            StillEncoding::default(),
            0,
        );
        assert!(matches!(ctl.start(), Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(ctl.state(), CaptureState::Idle);
        assert!(DeviceLease::claim("test://denied").is_some());
    }

    #[test]
    fn test_dark_frames_are_skipped() {
        let grabs = Arc::new(AtomicUsize::new(0));
        let backend = DimBackend {
            dark: 2,
            grabs: grabs.clone(),
        };
        let mut ctl = CaptureController::new(Box::new(backend), "test://dim", StillEncoding::default(), 0);
        ctl.start().unwrap();

        let still = ctl.capture_frame().unwrap();
        assert_eq!(still.sequence, 2);
        assert_eq!(grabs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_warmup_grabs_surface_on_capture() {
        let grabs = Arc::new(AtomicUsize::new(0));
        let backend = BrokenBackend { grabs: grabs.clone() };
        let mut ctl = CaptureController::new(Box::new(backend), "test://broken", StillEncoding::default(), 3);

        ctl.start().unwrap();
        assert_eq!(ctl.state(), CaptureState::Streaming);
        assert_eq!(grabs.load(Ordering::SeqCst), 3);

        assert!(matches!(ctl.capture_frame(), Err(CaptureError::DeviceUnavailable(_))));
        assert_eq!(grabs.load(Ordering::SeqCst), 4);
    }
}
