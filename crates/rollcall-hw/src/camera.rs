//! V4L2 camera capture via the `v4l` crate.
//!
//! A [`V4lCamera`] starts streaming when it is opened and keeps its mmap
//! buffers queued until it is dropped, so a still is always sampled from
//! the live stream rather than from a freshly restarted one.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Requested capture size; drivers may negotiate something else.
const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
/// Queued buffers older than this no longer show the room; drain them first.
const STALE_AFTER: Duration = Duration::from_millis(500);
/// Highest `/dev/videoN` index probed by [`list_devices`].
const MAX_VIDEO_NODES: u32 = 16;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("{0} is busy")]
    Busy(String),
    #[error("{0} is not a video capture device")]
    NotCaptureDevice(String),
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    #[error("camera I/O failed: {0}")]
    Io(String),
}

impl CameraError {
    fn from_open(device_path: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CameraError::NotFound(device_path.to_string()),
            io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.to_string()),
            _ if err.raw_os_error() == Some(EBUSY) => CameraError::Busy(device_path.to_string()),
            _ => CameraError::Io(format!("{device_path}: {err}")),
        }
    }
}

/// A capture device found by [`list_devices`].
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub card: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can deliver; all are reduced to 8-bit luma.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed YUYV 4:2:2; the Y samples are kept.
    Yuyv,
    /// 8-bit luma.
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"Y16 " | b"Y16\0" => Some(PixelFormat::Y16),
            _ => None,
        }
    }

    fn to_grayscale(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, frame::FrameError> {
        match self {
            PixelFormat::Yuyv => frame::luma_plane(buf, width, height, 2, 0),
            PixelFormat::Y16 => frame::luma_plane(buf, width, height, 2, 1),
            PixelFormat::Grey => frame::luma_plane(buf, width, height, 1, 0),
        }
    }
}

/// An opened device that yields grayscale frames.
pub trait FrameGrabber: Send {
    fn grab(&mut self) -> Result<Frame, CameraError>;
}

/// Opens camera devices by path.
pub trait CameraBackend: Send {
    fn open(&self, device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError>;
}

/// Backend for real V4L2 devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct V4lBackend;

impl CameraBackend for V4lBackend {
    fn open(&self, device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError> {
        Ok(Box::new(V4lCamera::open(device_path)?))
    }
}

/// A streaming V4L2 capture device.
pub struct V4lCamera {
    stream: MmapStream<'static>,
    device_path: String,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    last_grab: Option<Instant>,
}

impl V4lCamera {
    /// Open `device_path`, negotiate a luma-capable format and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| CameraError::from_open(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::Io(format!("{device_path}: query caps: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCaptureDevice(device_path.to_string()));
        }

        let mut wanted = device
            .format()
            .map_err(|e| CameraError::Io(format!("{device_path}: get format: {e}")))?;
        wanted.fourcc = FourCC::new(b"YUYV");
        wanted.width = REQUESTED_WIDTH;
        wanted.height = REQUESTED_HEIGHT;
        let format = device
            .set_format(&wanted)
            .map_err(|e| CameraError::Io(format!("{device_path}: set format: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(format.fourcc)
            .ok_or_else(|| CameraError::UnsupportedFormat(format.fourcc.to_string()))?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::from_open(device_path, e))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            driver = %caps.driver,
            width = format.width,
            height = format.height,
            pixel_format = ?pixel_format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            device_path: device_path.to_string(),
            width: format.width,
            height: format.height,
            pixel_format,
            last_grab: None,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl FrameGrabber for V4lCamera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        if self.last_grab.is_some_and(|at| at.elapsed() > STALE_AFTER) {
            for _ in 0..STREAM_BUFFERS {
                self.stream
                    .next()
                    .map_err(|e| CameraError::Io(format!("{}: drain: {e}", self.device_path)))?;
            }
        }
        self.last_grab = Some(Instant::now());

        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::Io(format!("{}: dequeue: {e}", self.device_path)))?;
        let sequence = meta.sequence;

        let luma = self
            .pixel_format
            .to_grayscale(buf, self.width, self.height)
            .map_err(|e| CameraError::Io(format!("{}: {:?} buffer: {e}", self.device_path, self.pixel_format)))?;
        Ok(Frame::from_luma(luma, self.width, self.height, sequence))
    }
}

/// Probe `/dev/video0..15` for video capture nodes.
pub fn list_devices() -> Vec<DeviceInfo> {
    (0..MAX_VIDEO_NODES)
        .map(|i| format!("/dev/video{i}"))
        .filter(|path| Path::new(path).exists())
        .filter_map(|path| {
            let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
            caps.capabilities
                .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                .then(|| DeviceInfo {
                    path,
                    card: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_device_is_not_found() {
        let result = V4lBackend.open("/dev/rollcall-no-such-video");
        assert!(matches!(result, Err(CameraError::NotFound(_))));
    }

    #[test]
    fn test_fourcc_mapping() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"Y16 ")), Some(PixelFormat::Y16));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), None);
    }

    #[test]
    fn test_grey_buffer_is_cropped_to_frame() {
        let buf = vec![7u8; 2 * 2 + 3];
        let gray = PixelFormat::Grey.to_grayscale(&buf, 2, 2).unwrap();
        assert_eq!(gray, vec![7; 4]);
    }

    #[test]
    fn test_short_grey_buffer_rejected() {
        assert!(PixelFormat::Grey.to_grayscale(&[0u8; 3], 2, 2).is_err());
    }
}
