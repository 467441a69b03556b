//! Synthetic camera producing a moving test pattern.
//!
//! Selected with the device path `synthetic` for diagnostics and tests on
//! machines without a camera.

use crate::camera::{CameraBackend, CameraError, FrameGrabber};
use crate::frame::Frame;

/// Device path that selects the synthetic camera.
pub const SYNTHETIC_DEVICE: &str = "synthetic";

#[derive(Debug, Clone, Copy)]
pub struct SyntheticBackend {
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
        }
    }
}

impl CameraBackend for SyntheticBackend {
    fn open(&self, _device_path: &str) -> Result<Box<dyn FrameGrabber>, CameraError> {
        Ok(Box::new(SyntheticCamera {
            width: self.width,
            height: self.height,
            sequence: 0,
        }))
    }
}

struct SyntheticCamera {
    width: u32,
    height: u32,
    sequence: u32,
}

impl FrameGrabber for SyntheticCamera {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        let offset = self.sequence;
        let data: Vec<u8> = (0..self.height)
            .flat_map(|y| (0..self.width).map(move |x| (x.wrapping_add(y).wrapping_add(offset) % 192 + 64) as u8))
            .collect();
        let frame = Frame::from_luma(data, self.width, self.height, self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(frame)
    }
}

/// Pick the backend for a configured device path.
pub fn backend_for(device_path: &str) -> Box<dyn CameraBackend> {
    if device_path == SYNTHETIC_DEVICE {
        Box::new(SyntheticBackend::default())
    } else {
        Box::new(crate::camera::V4lBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_frames_advance() {
        let mut cam = SyntheticBackend::default().open(SYNTHETIC_DEVICE).unwrap();
        let first = cam.grab().unwrap();
        let second = cam.grab().unwrap();
        assert_eq!(first.data.len(), 160 * 120);
        assert_eq!(second.sequence, first.sequence + 1);
        assert_ne!(first.data, second.data);
        assert!(!first.is_dark);
    }
}
