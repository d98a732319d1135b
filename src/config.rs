//! Configuration for recdeck.
//!
//! Static configuration sources (highest priority first):
//! 1. Environment variables (RECDECK_HOME, RECDECK_DB)
//! 2. Config file (.recdeck/config.yaml)
//! 3. Defaults (~/.recdeck)
//!
//! The nearest `.recdeck/config.yaml` at or above the working directory
//! wins. `home` and `database` resolve against `.recdeck/`, media
//! directories against the directory that contains it.
//!
//! Capture settings that operators change at runtime (device, storage path,
//! camera credentials) live in the `system_config` table and are read through
//! [`ConfigSource`] on every driver tick, never cached.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::capture::devices::DeviceSelector;
use crate::core::admission::AdmissionLimits;
use crate::core::store::Store;

/// Loaded once per process; a load error is kept and re-reported
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// On-disk YAML layout
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: AdmissionLimits,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub transcode: TranscodeConfig,
    #[serde(default)]
    pub driver: DriverConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// State directory (relative to .recdeck/)
    pub home: Option<String>,
    /// SQLite database file (relative to home)
    pub database: Option<String>,
    /// Audio output directory (relative to project root)
    pub audio_dir: Option<String>,
    /// Video storage root holding raw/ and processed/ (relative to project root)
    pub video_dir: Option<String>,
}

/// Process supervision settings shared by both capture lanes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Binary used for capture and transcode
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_path: String,

    /// Seconds to wait for a process to spawn before failing the start
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Seconds a graceful stop may take before the process is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Each audio channel file must be larger than this (bytes)
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,

    /// Device used when auto-detection finds no recognized interface
    #[serde(default = "default_fallback_device")]
    pub fallback_device: String,

    /// Capture device ("auto" or an ALSA id such as "hw:1")
    #[serde(default = "default_audio_device")]
    pub audio_device: String,

    /// Filename suffixes for the left and right channel files
    #[serde(default = "default_suffixes")]
    pub channel_suffixes: (String, String),

    /// Refuse video storage paths that are not a mount point
    #[serde(default = "default_require_mount")]
    pub require_mount: bool,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_start_timeout() -> u64 {
    10
}
fn default_stop_grace() -> u64 {
    10
}
fn default_min_output_bytes() -> u64 {
    4096
} // larger than a bare WAV header
fn default_fallback_device() -> String {
    "hw:1".to_string()
}
fn default_audio_device() -> String {
    "auto".to_string()
}
fn default_suffixes() -> (String, String) {
    ("A".to_string(), "B".to_string())
}
fn default_require_mount() -> bool {
    true
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg(),
            start_timeout_secs: default_start_timeout(),
            stop_grace_secs: default_stop_grace(),
            min_output_bytes: default_min_output_bytes(),
            fallback_device: default_fallback_device(),
            audio_device: default_audio_device(),
            channel_suffixes: default_suffixes(),
            require_mount: default_require_mount(),
        }
    }
}

/// Transcode pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Preferred hardware encoder
    #[serde(default = "default_hw_encoder")]
    pub hardware_encoder: String,

    /// Used when the hardware encoder is not available
    #[serde(default = "default_sw_encoder")]
    pub software_encoder: String,

    #[serde(default = "default_bitrate")]
    pub bitrate: String,

    /// Remove the raw capture after a verified transcode
    #[serde(default = "default_delete_raw")]
    pub delete_raw_after_transcode: bool,

    /// Allowed difference between source and output duration (seconds)
    #[serde(default = "default_duration_tolerance")]
    pub duration_tolerance_secs: f64,
}

fn default_hw_encoder() -> String {
    "h264_v4l2m2m".to_string()
}
fn default_sw_encoder() -> String {
    "libx264".to_string()
}
fn default_bitrate() -> String {
    "4M".to_string()
}
fn default_delete_raw() -> bool {
    true
}
fn default_duration_tolerance() -> f64 {
    5.0
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            hardware_encoder: default_hw_encoder(),
            software_encoder: default_sw_encoder(),
            bitrate: default_bitrate(),
            delete_raw_after_transcode: default_delete_raw(),
            duration_tolerance_secs: default_duration_tolerance(),
        }
    }
}

/// Scheduling loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Seconds between ticks
    #[serde(default = "default_tick")]
    pub tick_secs: u64,

    /// How late after its start an occurrence may still be triggered
    #[serde(default = "default_start_tolerance")]
    pub start_tolerance_secs: u64,
}

fn default_tick() -> u64 {
    5
}
fn default_start_tolerance() -> u64 {
    120
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
            start_tolerance_secs: default_start_tolerance(),
        }
    }
}

/// Static configuration after env, file and defaults are merged
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// State directory
    pub home: PathBuf,
    /// SQLite database path
    pub database: PathBuf,
    /// Default audio output directory
    pub audio_dir: PathBuf,
    /// Default video storage root
    pub video_dir: PathBuf,
    /// The YAML file these values came from, if any
    pub config_file: Option<PathBuf>,
    pub limits: AdmissionLimits,
    pub capture: CaptureConfig,
    pub transcode: TranscodeConfig,
    pub driver: DriverConfig,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, for tests and first runs
    pub fn rooted_at(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            database: home.join("recdeck.db"),
            audio_dir: home.join("recordings"),
            video_dir: home.join("video"),
            config_file: None,
            limits: AdmissionLimits::default(),
            capture: CaptureConfig::default(),
            transcode: TranscodeConfig::default(),
            driver: DriverConfig::default(),
        }
    }
}

/// Walk up from the working directory to the first `.recdeck/config.yaml`
fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    cwd.ancestors()
        .map(|dir| dir.join(".recdeck").join("config.yaml"))
        .find(|candidate| candidate.is_file())
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("Invalid YAML in {}", path.display()))
}

/// Absolute paths pass through; relative ones hang off `base`
fn resolve_path(base: &Path, value: &str) -> PathBuf {
    let candidate = Path::new(value);
    if candidate.is_absolute() {
        return candidate.to_path_buf();
    }
    let joined = base.join(candidate);
    joined.canonicalize().unwrap_or(joined)
}

fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("No home directory for the default state path")?
        .join(".recdeck");

    let config_file = find_config_file();
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .recdeck/ and the project root above it
    let recdeck_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let base_dir = recdeck_dir
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = if let Ok(env_home) = std::env::var("RECDECK_HOME") {
        PathBuf::from(env_home)
    } else if let (Some(dir), Some(home_path)) = (&recdeck_dir, &file.paths.home) {
        resolve_path(dir, home_path)
    } else {
        default_home
    };

    let database = if let Ok(env_db) = std::env::var("RECDECK_DB") {
        PathBuf::from(env_db)
    } else if let Some(ref db) = file.paths.database {
        resolve_path(&home, db)
    } else {
        home.join("recdeck.db")
    };

    let relative_to_root = |value: &Option<String>, fallback: PathBuf| match (value, &base_dir) {
        (Some(path), Some(base)) => resolve_path(base, path),
        (Some(path), None) => PathBuf::from(path),
        (None, _) => fallback,
    };
    let audio_dir = relative_to_root(&file.paths.audio_dir, home.join("recordings"));
    let video_dir = relative_to_root(&file.paths.video_dir, home.join("video"));

    Ok(ResolvedConfig {
        home,
        database,
        audio_dir,
        video_dir,
        config_file,
        limits: file.limits,
        capture: file.capture,
        transcode: file.transcode,
        driver: file.driver,
    })
}

/// Process-wide configuration, loaded on first use
pub fn config() -> Result<&'static ResolvedConfig> {
    match CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e))) {
        Ok(resolved) => Ok(resolved),
        Err(message) => anyhow::bail!("Configuration unavailable: {}", message),
    }
}

// ============================================================================
// Runtime capture settings (system_config table)
// ============================================================================

/// Keys read from the `system_config` table
pub mod keys {
    pub const AUDIO_DEVICE: &str = "audio_device";
    pub const AUDIO_DIR: &str = "audio_dir";
    pub const STORAGE_PATH: &str = "storage_path";
    pub const REQUIRE_MOUNT: &str = "require_mount";
    pub const STREAM_URL: &str = "stream_url";
    pub const CAMERA_IP: &str = "camera_ip";
    pub const CAMERA_USERNAME: &str = "camera_username";
    pub const CAMERA_PASSWORD: &str = "camera_password";
    pub const CHANNEL_SUFFIX_LEFT: &str = "channel_suffix_left";
    pub const CHANNEL_SUFFIX_RIGHT: &str = "channel_suffix_right";

    /// Every key the capture path reads
    pub const ALL: [&str; 10] = [
        AUDIO_DEVICE,
        AUDIO_DIR,
        STORAGE_PATH,
        REQUIRE_MOUNT,
        STREAM_URL,
        CAMERA_IP,
        CAMERA_USERNAME,
        CAMERA_PASSWORD,
        CHANNEL_SUFFIX_LEFT,
        CHANNEL_SUFFIX_RIGHT,
    ];
}

/// Snapshot of the settings one capture decision needs
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
    pub audio_device: DeviceSelector,
    pub fallback_device: String,
    pub audio_dir: PathBuf,
    pub video_dir: PathBuf,
    pub require_mount: bool,
    pub stream_url: Option<String>,
    pub channel_suffixes: (String, String),
}

impl CaptureSettings {
    /// Settings derived from static configuration only
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            audio_device: config
                .capture
                .audio_device
                .parse()
                .unwrap_or(DeviceSelector::Auto),
            fallback_device: config.capture.fallback_device.clone(),
            audio_dir: config.audio_dir.clone(),
            video_dir: config.video_dir.clone(),
            require_mount: config.capture.require_mount,
            stream_url: None,
            channel_suffixes: config.capture.channel_suffixes.clone(),
        }
    }
}

/// Source of fresh capture settings, consulted on every use
pub trait ConfigSource: Send + Sync {
    fn capture_settings(&self) -> Result<CaptureSettings>;
}

/// Static settings, for tests and one-shot CLI commands
impl ConfigSource for CaptureSettings {
    fn capture_settings(&self) -> Result<CaptureSettings> {
        Ok(self.clone())
    }
}

/// Overlays `system_config` rows on top of the static configuration
pub struct StoreConfigSource {
    store: Arc<Store>,
    defaults: CaptureSettings,
}

impl StoreConfigSource {
    pub fn new(store: Arc<Store>, defaults: CaptureSettings) -> Self {
        Self { store, defaults }
    }
}

impl ConfigSource for StoreConfigSource {
    fn capture_settings(&self) -> Result<CaptureSettings> {
        let mut settings = self.defaults.clone();
        let get = |key: &str| -> Result<Option<String>> {
            Ok(self
                .store
                .get_config(key)
                .with_context(|| format!("Failed to read config key '{}'", key))?
                .filter(|v| !v.trim().is_empty()))
        };

        if let Some(device) = get(keys::AUDIO_DEVICE)? {
            settings.audio_device = device.parse().map_err(|e: String| {
                anyhow::anyhow!("Invalid audio device setting '{}': {}", device, e)
            })?;
        }
        if let Some(dir) = get(keys::AUDIO_DIR)? {
            settings.audio_dir = PathBuf::from(dir);
        }
        if let Some(path) = get(keys::STORAGE_PATH)? {
            settings.video_dir = PathBuf::from(path);
        }
        if let Some(flag) = get(keys::REQUIRE_MOUNT)? {
            settings.require_mount = matches!(flag.as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(left) = get(keys::CHANNEL_SUFFIX_LEFT)? {
            settings.channel_suffixes.0 = left;
        }
        if let Some(right) = get(keys::CHANNEL_SUFFIX_RIGHT)? {
            settings.channel_suffixes.1 = right;
        }
        check_channel_suffixes(&settings.channel_suffixes)?;

        settings.stream_url = match get(keys::STREAM_URL)? {
            Some(url) => Some(url),
            None => get(keys::CAMERA_IP)?.map(|ip| {
                rtsp_url(
                    &ip,
                    get(keys::CAMERA_USERNAME).ok().flatten().as_deref(),
                    get(keys::CAMERA_PASSWORD).ok().flatten().as_deref(),
                )
            }),
        };

        Ok(settings)
    }
}

/// Camera RTSP URL, credentials percent-encoded when both are present
pub fn rtsp_url(camera_ip: &str, username: Option<&str>, password: Option<&str>) -> String {
    match (username, password) {
        (Some(user), Some(pass)) => format!(
            "rtsp://{}:{}@{}/1",
            urlencoding::encode(user),
            urlencoding::encode(pass),
            camera_ip
        ),
        _ => format!("rtsp://{}/1", camera_ip),
    }
}

/// Each channel needs its own file next to the other
fn check_channel_suffixes((left, right): &(String, String)) -> Result<()> {
    for suffix in [left, right] {
        if suffix.contains(['/', '\\']) {
            anyhow::bail!("Channel suffix '{}' must not contain a path separator", suffix);
        }
    }
    if left == right {
        anyhow::bail!("Channel suffixes must differ, both are '{}'", left);
    }
    Ok(())
}
