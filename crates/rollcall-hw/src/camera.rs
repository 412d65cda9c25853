//! Live capture from a V4L2 webcam.

use crate::frame::{self, Frame, FrameError};
use chrono::{DateTime, Utc};
use image::RgbImage;
use nix::time::{clock_gettime, ClockId};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUEST_WIDTH: u32 = 640;
const REQUEST_HEIGHT: u32 = 480;
const MMAP_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no such device: {}", .0.display())]
    NotFound(PathBuf),
    #[error("{} is in use by another process", .0.display())]
    Busy(PathBuf),
    #[error("{} is not a video capture device", .0.display())]
    NotCapture(PathBuf),
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unsupported pixel format {0}")]
    UnsupportedFormat(String),
    #[error("frame conversion failed: {0}")]
    Convert(#[from] FrameError),
}

impl CameraError {
    fn io(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::Io { op, source }
    }
}

/// Anything that yields color frames one at a time.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError>;

    /// Throw away frames captured before this call. Sources that don't
    /// buffer have nothing to drop.
    fn discard_queued(&mut self) -> Result<(), CameraError> {
        Ok(())
    }
}

/// A capture-capable node found under `/dev`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Buffer layouts the camera can hand back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, the usual webcam format.
    Yuyv,
    Grey,
    /// 16-bit little-endian luma.
    Y16,
}

impl TryFrom<FourCC> for PixelFormat {
    type Error = CameraError;

    fn try_from(fourcc: FourCC) -> Result<Self, Self::Error> {
        match &fourcc.repr {
            b"YUYV" => Ok(Self::Yuyv),
            b"GREY" => Ok(Self::Grey),
            b"Y16 " | b"Y16\0" => Ok(Self::Y16),
            _ => Err(CameraError::UnsupportedFormat(format!("{fourcc:?}"))),
        }
    }
}

impl PixelFormat {
    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// An opened webcam with a negotiated format.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    format: PixelFormat,
}

impl Camera {
    /// Open `path` and ask for 640×480 YUYV. Drivers that can't do YUYV may
    /// answer with GREY or Y16, which are accepted too.
    pub fn open(path: &str) -> Result<Self, CameraError> {
        let node = PathBuf::from(path);
        if !node.exists() {
            return Err(CameraError::NotFound(node));
        }

        let device = Device::with_path(&node).map_err(|e| match e.raw_os_error() {
            Some(EBUSY) => CameraError::Busy(node.clone()),
            _ => CameraError::Io { op: "open", source: e },
        })?;

        let caps = device.query_caps().map_err(CameraError::io("query capabilities"))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(node));
        }

        let mut requested = device.format().map_err(CameraError::io("get format"))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = REQUEST_WIDTH;
        requested.height = REQUEST_HEIGHT;
        let actual = device
            .set_format(&requested)
            .map_err(CameraError::io("set format"))?;
        let format = PixelFormat::try_from(actual.fourcc)?;

        tracing::info!(
            device = path,
            card = %caps.card,
            width = actual.width,
            height = actual.height,
            ?format,
            "camera ready"
        );

        Ok(Self {
            device,
            width: actual.width,
            height: actual.height,
            format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.format
    }

    /// Start streaming. Frames come from a small ring of mmap buffers.
    pub fn stream(&self) -> Result<CameraStream<'_>, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(CameraError::io("start stream"))?;
        Ok(CameraStream { camera: self, stream })
    }

    /// Every `/dev/video*` node that reports the capture capability, by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut nodes: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_video_node(p))
            .collect();
        nodes.sort();

        nodes
            .into_iter()
            .filter_map(|node| {
                let caps = Device::with_path(&node).and_then(|d| d.query_caps()).ok()?;
                caps.capabilities
                    .contains(Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path: node.display().to_string(),
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

fn is_video_node(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("video"))
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// A running capture stream borrowed from a [`Camera`].
pub struct CameraStream<'a> {
    camera: &'a Camera,
    stream: MmapStream<'a>,
}

impl FrameSource for CameraStream<'_> {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self.stream.next().map_err(CameraError::io("dequeue buffer"))?;
        let cam = self.camera;
        let image = cam.format.to_rgb(buf, cam.width, cam.height)?;
        let buffer_us = meta.timestamp.sec as i64 * 1_000_000 + meta.timestamp.usec as i64;
        let captured_at = capture_time(Utc::now(), monotonic_now_us(), buffer_us);
        let frame = Frame::captured(image, meta.sequence, captured_at);
        if frame.is_dark {
            tracing::debug!(seq = meta.sequence, "dark frame");
        }
        Ok(frame)
    }

    /// Dequeue every buffer the driver filled while nobody was reading.
    fn discard_queued(&mut self) -> Result<(), CameraError> {
        for _ in 0..MMAP_BUFFERS {
            self.stream.next().map_err(CameraError::io("dequeue buffer"))?;
        }
        tracing::debug!(buffers = MMAP_BUFFERS, "discarded queued frames");
        Ok(())
    }
}

fn monotonic_now_us() -> Option<i64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).ok()?;
    Some(now.tv_sec() as i64 * 1_000_000 + now.tv_nsec() as i64 / 1_000)
}

/// Wall-clock capture time of a buffer stamped on the monotonic clock.
///
/// Falls back to `wall_now` when the driver left the stamp empty or it lies
/// in the future.
fn capture_time(wall_now: DateTime<Utc>, mono_now_us: Option<i64>, buffer_us: i64) -> DateTime<Utc> {
    match mono_now_us {
        Some(now_us) if buffer_us > 0 && buffer_us <= now_us => {
            wall_now - chrono::Duration::microseconds(now_us - buffer_us)
        }
        _ => wall_now,
    }
}
