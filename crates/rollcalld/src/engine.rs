use chrono::Utc;
use rollcall_core::{FaceDetector, FrameReport, Mode, Tracker};
use rollcall_hw::{Camera, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("frame error: {0}")]
    Frame(#[from] rollcall_hw::FrameError),
    #[error("failed to start engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    SubmitFrame {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Decode an uploaded still and run it through the current mode's pipeline.
    pub async fn submit_frame(&self, bytes: Vec<u8>) -> Result<FrameReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::SubmitFrame {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

pub struct EngineSettings {
    pub warmup_frames: usize,
    pub capture_interval: Duration,
}

/// Spawn the engine on a dedicated OS thread.
///
/// The engine owns the detector and, when present, the camera. With a
/// camera it captures continuously whenever the tracker is not idle and
/// services uploads between captures; without one it only services uploads.
pub fn spawn_engine<D>(
    tracker: Arc<Tracker>,
    mut detector: D,
    camera: Option<Camera>,
    settings: EngineSettings,
) -> Result<EngineHandle, EngineError>
where
    D: FaceDetector + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(camera = camera.is_some(), "engine thread started");
            let stream = camera.as_ref().and_then(|c| match c.stream() {
                Ok(s) => Some(s),
                Err(e) => {
                    tracing::error!(error = %e, "camera stream failed to start; serving uploads only");
                    None
                }
            });

            match stream {
                Some(mut stream) => {
                    discard_warmup(&mut stream, settings.warmup_frames);
                    live_loop(&tracker, &mut detector, &mut stream, &mut rx, settings.capture_interval);
                }
                None => {
                    while let Some(req) = rx.blocking_recv() {
                        handle_request(&tracker, &mut detector, req);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

/// Discard warmup frames for camera AGC/AE stabilization.
fn discard_warmup(stream: &mut dyn FrameSource, count: usize) {
    if count > 0 {
        tracing::info!(count, "discarding warmup frames");
        for _ in 0..count {
            let _ = stream.next_frame();
        }
    }
}

/// Capture while the tracker wants frames, servicing uploads in between.
///
/// The driver keeps filling its buffers while the loop is idle, so those
/// are dropped before the first capture after leaving Idle.
fn live_loop(
    tracker: &Tracker,
    detector: &mut dyn FaceDetector,
    source: &mut dyn FrameSource,
    rx: &mut mpsc::Receiver<EngineRequest>,
    interval: Duration,
) {
    let mut idle = true;
    loop {
        loop {
            match rx.try_recv() {
                Ok(req) => handle_request(tracker, detector, req),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if tracker.mode() == Mode::Idle {
            idle = true;
        } else {
            if idle {
                match source.discard_queued() {
                    Ok(()) => idle = false,
                    Err(e) => tracing::warn!(error = %e, "failed to drop queued frames"),
                }
            }
            if !idle {
                match source.next_frame() {
                    Ok(frame) if frame.is_dark => {}
                    Ok(frame) => {
                        let report = tracker.process_frame(detector, &frame.image, frame.captured_at);
                        if !report.faces.is_empty() {
                            tracing::trace!(seq = frame.sequence, faces = report.faces.len(), "frame processed");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "capture failed"),
                }
            }
        }
        std::thread::sleep(interval);
    }
}

fn handle_request(tracker: &Tracker, detector: &mut dyn FaceDetector, req: EngineRequest) {
    match req {
        EngineRequest::SubmitFrame { bytes, reply } => {
            let result = rollcall_hw::decode_still(&bytes)
                .map(|frame| tracker.process_frame(detector, &frame.image, Utc::now()))
                .map_err(EngineError::from);
            if let Err(e) = &result {
                tracing::warn!(bytes = bytes.len(), error = %e, "rejected submitted frame");
            }
            let _ = reply.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rollcall_core::{
        BoundingBox, Collaborators, DetectionError, EnrollmentPhase, FaceLabel, TrackerConfig,
    };
    use rollcall_hw::{CameraError, Frame};
    use rollcall_store::SqliteStore;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports one face in the middle of every non-empty frame.
    struct CenterDetector;

    impl FaceDetector for CenterDetector {
        fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectionError> {
            if frame.width() < 100 || frame.height() < 100 {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox {
                x: 50.0,
                y: 50.0,
                width: 100.0,
                height: 100.0,
                confidence: 0.9,
            }])
        }
    }

    fn png_frame(seed: u32) -> Vec<u8> {
        let mut state = seed.wrapping_mul(2_654_435_761) | 1;
        let img = RgbImage::from_fn(200, 200, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let v = (state & 0xFF) as u8;
            Rgb([v, v, v])
        });
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    fn tracker(quota: usize) -> Arc<Tracker> {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let config = TrackerConfig {
            enrollment_quota: quota,
            status_hold: Duration::from_secs(60),
            ..TrackerConfig::default()
        };
        let collab = Collaborators {
            models: db.clone(),
            directory: db.clone(),
            sink: db,
        };
        Arc::new(Tracker::open(config, collab).unwrap())
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            warmup_frames: 0,
            capture_interval: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_uploaded_frames_drive_enrollment_and_recognition() {
        let tracker = tracker(3);
        let engine = spawn_engine(tracker.clone(), CenterDetector, None, settings()).unwrap();

        tracker.start_enrollment("Alice", "E1").unwrap();
        for seed in 1..=3 {
            let report = engine.submit_frame(png_frame(seed)).await.unwrap();
            assert_eq!(report.faces[0].label, FaceLabel::Captured);
        }

        let mut phase = EnrollmentPhase::Training;
        for _ in 0..500 {
            phase = tracker.status(Utc::now()).phase;
            if phase != EnrollmentPhase::Training {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(phase, EnrollmentPhase::Complete);

        tracker.set_mode(Mode::Recognizing).unwrap();
        let report = engine.submit_frame(png_frame(2)).await.unwrap();
        assert!(matches!(
            &report.faces[0].label,
            FaceLabel::Recognized { external_id, .. } if external_id == "E1"
        ));
        assert_eq!(tracker.attendance().len(), 1);
    }

    /// Hands out bright frames and counts queue flushes.
    struct CountingSource {
        frames: Arc<AtomicUsize>,
        flushes: Arc<AtomicUsize>,
    }

    impl FrameSource for CountingSource {
        fn next_frame(&mut self) -> Result<Frame, CameraError> {
            let seq = self.frames.fetch_add(1, Ordering::SeqCst) as u32;
            Ok(Frame::new(RgbImage::from_pixel(200, 200, Rgb([200, 200, 200])), seq))
        }

        fn discard_queued(&mut self) -> Result<(), CameraError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_live_loop_drops_queued_frames_when_leaving_idle() {
        let tracker = tracker(3);
        let frames = Arc::new(AtomicUsize::new(0));
        let flushes = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<EngineRequest>(1);

        let worker = {
            let tracker = tracker.clone();
            let mut source = CountingSource {
                frames: frames.clone(),
                flushes: flushes.clone(),
            };
            std::thread::spawn(move || {
                live_loop(&tracker, &mut CenterDetector, &mut source, &mut rx, Duration::from_millis(2));
            })
        };

        let pause = || std::thread::sleep(Duration::from_millis(60));
        pause();
        assert_eq!(frames.load(Ordering::SeqCst), 0, "idle loop must not capture");
        assert_eq!(flushes.load(Ordering::SeqCst), 0);

        tracker.set_mode(Mode::Recognizing).unwrap();
        pause();
        tracker.set_mode(Mode::Idle).unwrap();
        pause();
        let captured = frames.load(Ordering::SeqCst);
        assert!(captured > 0);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);

        tracker.set_mode(Mode::Recognizing).unwrap();
        pause();
        drop(tx);
        worker.join().unwrap();

        assert_eq!(flushes.load(Ordering::SeqCst), 2);
        assert!(frames.load(Ordering::SeqCst) > captured);
    }

    #[tokio::test]
    async fn test_undecodable_upload_is_rejected() {
        let engine = spawn_engine(tracker(3), CenterDetector, None, settings()).unwrap();
        let err = engine.submit_frame(b"garbage".to_vec()).await.unwrap_err();
        assert!(matches!(err, EngineError::Frame(_)));
    }

    #[tokio::test]
    async fn test_idle_upload_reports_no_faces() {
        let engine = spawn_engine(tracker(3), CenterDetector, None, settings()).unwrap();
        let report = engine.submit_frame(png_frame(1)).await.unwrap();
        assert_eq!(report.mode, Mode::Idle);
        assert!(report.faces.is_empty());
    }
}
