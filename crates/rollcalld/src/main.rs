use anyhow::{Context, Result};
use rollcall_core::{Collaborators, ScaledDetector, ScrfdDetector, Tracker};
use rollcall_hw::Camera;
use rollcall_store::{FileModelStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

const BUS_NAME: &str = "org.rollcall.Daemon1";
const OBJECT_PATH: &str = "/org/rollcall/Daemon1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    let db = Arc::new(SqliteStore::open(&config.db_path).context("opening database")?);
    let model_file = Arc::new(FileModelStore::new(&config.model_path).with_secondary(db.clone()));

    // A corrupt model is fatal rather than silently retrained from scratch.
    let tracker = Arc::new(
        Tracker::open(
            config.tracker_config(),
            Collaborators {
                models: model_file.clone(),
                directory: db.clone(),
                sink: db.clone(),
            },
        )
        .context("restoring tracker state")?,
    );

    let scrfd_path = config.scrfd_model_path();
    let detector = ScaledDetector::new(
        ScrfdDetector::load(&scrfd_path).context("loading face detector")?,
        config.detect_scale,
        config.min_face_size,
    );
    tracing::info!(path = %scrfd_path.display(), "SCRFD detector loaded");

    let camera = if config.camera_enabled {
        match Camera::open(&config.camera_device) {
            Ok(camera) => {
                tracing::info!(
                    device = %config.camera_device,
                    width = camera.width,
                    height = camera.height,
                    format = ?camera.pixel_format(),
                    "camera opened"
                );
                Some(camera)
            }
            Err(e) => {
                tracing::warn!(
                    device = %config.camera_device,
                    error = %e,
                    "camera unavailable; serving uploaded frames only"
                );
                None
            }
        }
    } else {
        tracing::info!("camera disabled via ROLLCALL_CAMERA_ENABLED=0");
        None
    };

    let engine = engine::spawn_engine(
        tracker.clone(),
        detector,
        camera,
        engine::EngineSettings {
            warmup_frames: config.warmup_frames,
            capture_interval: Duration::from_millis(config.capture_interval_ms),
        },
    )?;

    let service = dbus_interface::RollcallService::new(tracker, engine, db, model_file);
    let builder = if config.system_bus {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(bus = BUS_NAME, "rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
