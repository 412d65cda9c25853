use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.rollcall.Daemon1",
    default_service = "org.rollcall.Daemon1",
    default_path = "/org/rollcall/Daemon1"
)]
trait Rollcall {
    async fn set_mode(&self, mode: &str) -> zbus::Result<String>;
    async fn start_enrollment(&self, display_name: &str, external_id: &str) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
    async fn current_recognition(&self) -> zbus::Result<String>;
    async fn attendance(&self) -> zbus::Result<String>;
    async fn submit_frame(&self, frame: Vec<u8>) -> zbus::Result<String>;
    async fn profile_image(&self, external_id: &str) -> zbus::Result<Vec<u8>>;
    async fn reset(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Face attendance tracker CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Switch the daemon to "idle" or "recognizing"
    Mode { mode: String },
    /// Enroll a person from the live camera or a directory of images
    Enroll {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// External identifier (student number, badge id, ...)
        #[arg(short, long)]
        id: String,
        /// Feed every image in this directory instead of the camera
        #[arg(long)]
        images: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Show the person recognized in the last few seconds
    Recognition,
    /// List today's attendance
    Attendance,
    /// Send one image file through the current pipeline
    Submit { path: PathBuf },
    /// Save a person's enrollment photo
    Profile {
        id: String,
        #[arg(short, long, default_value = "profile.jpg")]
        output: PathBuf,
    },
    /// List V4L2 capture devices
    Devices,
    /// Delete all people, attendance and the trained model
    Reset {
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = rollcall_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        command => run_remote(connect(cli.system).await?, command).await?,
    }

    Ok(())
}

async fn connect(system: bool) -> Result<RollcallProxy<'static>> {
    let conn = if system {
        zbus::Connection::system().await?
    } else {
        zbus::Connection::session().await?
    };
    RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable on D-Bus")
}

async fn run_remote(proxy: RollcallProxy<'static>, command: Commands) -> Result<()> {
    match command {
        Commands::Mode { mode } => {
            let now = proxy.set_mode(&mode).await?;
            println!("mode: {now}");
        }
        Commands::Enroll { name, id, images } => {
            proxy.start_enrollment(&name, &id).await?;
            println!("Enrolling {name} ({id})");
            let from_images = images.is_some();
            if let Some(dir) = images {
                submit_dir(&proxy, &dir).await?;
            }
            wait_for_enrollment(&proxy, from_images).await?;
        }
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Recognition => print_json(&proxy.current_recognition().await?)?,
        Commands::Attendance => {
            let records: Vec<Value> = serde_json::from_str(&proxy.attendance().await?)?;
            if records.is_empty() {
                println!("No attendance recorded today");
            }
            for r in records {
                println!(
                    "{}  {:<12} {}",
                    r["timestamp"].as_str().unwrap_or("?"),
                    r["external_id"].as_str().unwrap_or("?"),
                    r["display_name"].as_str().unwrap_or("?"),
                );
            }
        }
        Commands::Submit { path } => {
            let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            print_json(&proxy.submit_frame(bytes).await?)?;
        }
        Commands::Profile { id, output } => {
            let jpeg = proxy.profile_image(&id).await?;
            if jpeg.is_empty() {
                bail!("no profile image stored for {id}");
            }
            std::fs::write(&output, &jpeg).with_context(|| format!("writing {}", output.display()))?;
            println!("Saved {} bytes to {}", jpeg.len(), output.display());
        }
        Commands::Reset { yes } => {
            if !yes {
                bail!("reset deletes every enrolled person and all attendance; pass --yes to confirm");
            }
            proxy.reset().await?;
            println!("Reset complete");
        }
        Commands::Devices => {}
    }

    Ok(())
}

fn print_json(raw: &str) -> Result<()> {
    let value: Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Image files in `dir`, sorted by name.
fn image_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png" | "bmp"))
        })
        .collect();
    files.sort();
    Ok(files)
}

async fn submit_dir(proxy: &RollcallProxy<'_>, dir: &Path) -> Result<()> {
    let files = image_files(dir)?;
    if files.is_empty() {
        bail!("no images found in {}", dir.display());
    }
    for path in files {
        let bytes = std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        match proxy.submit_frame(bytes).await {
            Ok(report) => {
                let report: Value = serde_json::from_str(&report)?;
                let faces = report["faces"].as_array().map_or(0, Vec::len);
                tracing::debug!(path = %path.display(), faces, "submitted");
                if faces == 0 {
                    println!("  {}: no face found", path.display());
                }
            }
            Err(e) => println!("  {}: {e}", path.display()),
        }
    }
    Ok(())
}

/// Poll status until the session settles. Image enrollment cannot gain
/// more samples once the directory is exhausted, so it stops early.
async fn wait_for_enrollment(proxy: &RollcallProxy<'_>, from_images: bool) -> Result<()> {
    let mut last_progress = None;
    loop {
        let status: Value = serde_json::from_str(&proxy.status().await?)?;
        let status = &status["status"];
        let phase = status["phase"].as_str().unwrap_or("idle");
        let progress = status["progress"].as_u64().unwrap_or(0);
        let quota = status["quota"].as_u64().unwrap_or(0);

        match phase {
            "collecting" if from_images => bail!(
                "only {progress}/{quota} usable samples in the directory; \
                 add images and submit them, or change mode to abandon"
            ),
            "collecting" => {
                if last_progress != Some(progress) {
                    println!("  {progress}/{quota} samples");
                    last_progress = Some(progress);
                }
            }
            "training" => {}
            "complete" => {
                println!("Enrollment complete");
                return Ok(());
            }
            "failed" => bail!(
                "enrollment failed: {}",
                status["last_error"].as_str().unwrap_or("unknown error")
            ),
            _ => bail!("enrollment was abandoned"),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
