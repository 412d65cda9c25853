//! rollcall-hw: Frame sources.
//!
//! V4L2 camera capture converted to RGB, plus decoding of uploaded stills
//! into the same [`Frame`] type.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{decode_still, Frame, FrameError};
