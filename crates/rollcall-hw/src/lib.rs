//! rollcall-hw — Camera capture for attendance stills.
//!
//! Provides V4L2 camera access, grayscale conversion, still encoding and the
//! capture controller that owns a device for the duration of a session.

pub mod camera;
pub mod capture;
pub mod frame;
pub mod synthetic;

pub use camera::{
    list_devices, CameraBackend, CameraError, DeviceInfo, FrameGrabber, PixelFormat, V4lBackend,
    V4lCamera,
};
pub use capture::{CaptureController, DeviceLease};
pub use frame::{Frame, StillEncoding};
pub use synthetic::{backend_for, SyntheticBackend, SYNTHETIC_DEVICE};
