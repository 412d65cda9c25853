use rollcall_core::TrackerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: defaults, then the TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Whether to capture from the camera at all. Without it only uploaded
    /// frames are processed.
    pub camera_enabled: bool,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the primary copy of the recognition model.
    pub model_path: PathBuf,
    /// Maximum LBPH distance accepted as a match.
    pub confidence_threshold: f64,
    /// Minimum seconds between two attendance records for one person.
    pub cooldown_secs: u64,
    /// Samples collected per enrollment.
    pub enrollment_quota: usize,
    /// Detection runs on the frame scaled by this factor.
    pub detect_scale: f32,
    /// Faces smaller than this (full-frame pixels) are ignored.
    pub min_face_size: u32,
    pub recognition_window_secs: u64,
    pub status_hold_secs: u64,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Pause between live captures.
    pub capture_interval_ms: u64,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

/// On-disk form of [`Config`]; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_enabled: Option<bool>,
    model_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    model_path: Option<PathBuf>,
    confidence_threshold: Option<f64>,
    cooldown_secs: Option<u64>,
    enrollment_quota: Option<usize>,
    detect_scale: Option<f32>,
    min_face_size: Option<u32>,
    recognition_window_secs: Option<u64>,
    status_hold_secs: Option<u64>,
    warmup_frames: Option<usize>,
    capture_interval_ms: Option<u64>,
    system_bus: Option<bool>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = rollcall_store::default_data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_enabled: true,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("rollcall.db"),
            model_path: data_dir.join("trainer_model.bin"),
            confidence_threshold: 75.0,
            cooldown_secs: 30,
            enrollment_quota: 40,
            detect_scale: 0.5,
            min_face_size: 60,
            recognition_window_secs: 4,
            status_hold_secs: 2,
            warmup_frames: 4,
            capture_interval_ms: 100,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load configuration for the running process.
    ///
    /// An explicit `ROLLCALL_CONFIG` file must exist; the default location
    /// is optional.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let mut config = Self::default();

        match env("ROLLCALL_CONFIG") {
            Some(path) => config.apply_file(&read_file(Path::new(&path))?),
            None => {
                let path = default_config_path();
                if path.exists() {
                    config.apply_file(&read_file(&path)?);
                }
            }
        }

        config.apply_env(env);
        Ok(config)
    }

    fn apply_file(&mut self, file: &FileConfig) {
        overlay(&mut self.camera_device, &file.camera_device);
        overlay(&mut self.camera_enabled, &file.camera_enabled);
        overlay(&mut self.model_dir, &file.model_dir);
        overlay(&mut self.db_path, &file.db_path);
        overlay(&mut self.model_path, &file.model_path);
        overlay(&mut self.confidence_threshold, &file.confidence_threshold);
        overlay(&mut self.cooldown_secs, &file.cooldown_secs);
        overlay(&mut self.enrollment_quota, &file.enrollment_quota);
        overlay(&mut self.detect_scale, &file.detect_scale);
        overlay(&mut self.min_face_size, &file.min_face_size);
        overlay(&mut self.recognition_window_secs, &file.recognition_window_secs);
        overlay(&mut self.status_hold_secs, &file.status_hold_secs);
        overlay(&mut self.warmup_frames, &file.warmup_frames);
        overlay(&mut self.capture_interval_ms, &file.capture_interval_ms);
        overlay(&mut self.system_bus, &file.system_bus);
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = env("ROLLCALL_CAMERA_ENABLED") {
            self.camera_enabled = v != "0";
        }
        if let Some(v) = env("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_MODEL_PATH") {
            self.model_path = PathBuf::from(v);
        }
        if let Some(v) = env("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v == "1";
        }
        env_parse(&env, "ROLLCALL_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        env_parse(&env, "ROLLCALL_COOLDOWN_SECS", &mut self.cooldown_secs);
        env_parse(&env, "ROLLCALL_ENROLLMENT_QUOTA", &mut self.enrollment_quota);
        env_parse(&env, "ROLLCALL_DETECT_SCALE", &mut self.detect_scale);
        env_parse(&env, "ROLLCALL_MIN_FACE_SIZE", &mut self.min_face_size);
        env_parse(&env, "ROLLCALL_RECOGNITION_WINDOW_SECS", &mut self.recognition_window_secs);
        env_parse(&env, "ROLLCALL_STATUS_HOLD_SECS", &mut self.status_hold_secs);
        env_parse(&env, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        env_parse(&env, "ROLLCALL_CAPTURE_INTERVAL_MS", &mut self.capture_interval_ms);
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            enrollment_quota: self.enrollment_quota,
            cooldown: Duration::from_secs(self.cooldown_secs),
            confidence_threshold: self.confidence_threshold,
            recognition_window: Duration::from_secs(self.recognition_window_secs),
            status_hold: Duration::from_secs(self.status_hold_secs),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(rollcall_core::detector::SCRFD_MODEL_FILE)
    }
}

fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("rollcall/rollcalld.toml")
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_file(path, &text)
}

fn parse_file(path: &Path, text: &str) -> Result<FileConfig, ConfigError> {
    toml::from_str(text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn overlay<T: Clone>(slot: &mut T, value: &Option<T>) {
    if let Some(v) = value {
        *slot = v.clone();
    }
}

/// Overwrite `slot` with a parsed env value; unparseable values are ignored.
fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.enrollment_quota, 40);
        assert_eq!(c.cooldown_secs, 30);
        assert_eq!(c.confidence_threshold, 75.0);
        assert_eq!(c.tracker_config().recognition_window, Duration::from_secs(4));
        assert!(c.scrfd_model_path().ends_with("det_10g.onnx"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file = parse_file(
            Path::new("test.toml"),
            "cooldown_secs = 10\nconfidence_threshold = 60.0\ncamera_device = \"/dev/video4\"\n",
        )
        .unwrap();
        let mut c = Config::default();
        c.apply_file(&file);
        c.apply_env(env_of(&[("ROLLCALL_COOLDOWN_SECS", "45"), ("ROLLCALL_CAMERA_ENABLED", "0")]));

        assert_eq!(c.cooldown_secs, 45);
        assert_eq!(c.confidence_threshold, 60.0);
        assert_eq!(c.camera_device, "/dev/video4");
        assert!(!c.camera_enabled);
    }

    #[test]
    fn test_bad_env_value_keeps_previous() {
        let mut c = Config::default();
        c.apply_env(env_of(&[("ROLLCALL_ENROLLMENT_QUOTA", "many")]));
        assert_eq!(c.enrollment_quota, 40);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        let err = parse_file(Path::new("bad.toml"), "colldown_secs = 3\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
