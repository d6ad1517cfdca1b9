//! Configuration persistence module
//!
//! Provides TOML-based configuration for echo sessions. The default file
//! lives in the platform-specific directory:
//! - Linux: ~/.config/echoloop/config.toml
//! - Windows: %APPDATA%\echoloop\config.toml
//! - macOS: ~/Library/Application Support/echoloop/config.toml

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::audio::{SampleFormat, MAX_DELAY_MS};

/// Application name used for configuration directory
const APP_NAME: &str = "echoloop";

/// Buffers circulating in the pipeline
pub const DEFAULT_BUFFER_COUNT: usize = 16;

/// Buffers a device may hold at once
pub const DEFAULT_DEVICE_QUEUE_DEPTH: usize = 4;

/// Buffers handed to the capture device on start
pub const DEFAULT_CAPTURE_KICKSTART: usize = 2;

/// Buffers handed to the playback device on start
pub const DEFAULT_PLAYBACK_KICKSTART: usize = 3;

/// How device completions reach the stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One worker thread per stage
    #[default]
    Threaded,
    /// The owner calls `EchoEngine::pump`
    Inline,
}

/// Echo session configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EchoConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Frames per device buffer
    pub frames_per_buffer: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Total buffers allocated for the session
    pub buffer_count: usize,
    /// Maximum buffers in flight per device
    pub device_queue_depth: usize,
    /// Buffers submitted to the capture device on start
    pub capture_kickstart: usize,
    /// Buffers submitted to the playback device on start
    pub playback_kickstart: usize,
    /// Echo delay in milliseconds
    pub delay_ms: u32,
    /// Echo decay weight (0.0 - 1.0)
    pub decay: f32,
    /// Request platform acoustic echo cancellation on the capture device
    pub echo_cancellation: bool,
    /// Request platform noise suppression on the capture device
    pub noise_suppression: bool,
    /// Input device name (None = system default)
    pub input_device: Option<String>,
    /// Output device name (None = system default)
    pub output_device: Option<String>,
    /// Completion dispatch
    pub dispatch: DispatchMode,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            frames_per_buffer: 240,
            channels: 1,
            buffer_count: DEFAULT_BUFFER_COUNT,
            device_queue_depth: DEFAULT_DEVICE_QUEUE_DEPTH,
            capture_kickstart: DEFAULT_CAPTURE_KICKSTART,
            playback_kickstart: DEFAULT_PLAYBACK_KICKSTART,
            delay_ms: 100,
            decay: 0.1,
            echo_cancellation: false,
            noise_suppression: false,
            input_device: None,
            output_device: None,
            dispatch: DispatchMode::Threaded,
        }
    }
}

impl EchoConfig {
    /// Validate the configuration values
    ///
    /// Returns an error message if any value is invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate == 0 {
            return Err("Sample rate must be greater than 0".to_string());
        }
        if self.frames_per_buffer == 0 {
            return Err("Frames per buffer must be greater than 0".to_string());
        }
        if self.channels == 0 {
            return Err("Channel count must be greater than 0".to_string());
        }
        if self.buffer_count == 0 {
            return Err("Buffer count must be greater than 0".to_string());
        }
        if self.device_queue_depth == 0 || self.device_queue_depth > self.buffer_count {
            return Err(format!(
                "Invalid device queue depth: {}. Must be between 1 and the buffer count ({})",
                self.device_queue_depth, self.buffer_count
            ));
        }
        for (name, kickstart) in [
            ("capture", self.capture_kickstart),
            ("playback", self.playback_kickstart),
        ] {
            if kickstart > self.device_queue_depth {
                return Err(format!(
                    "Invalid {} kickstart: {}. Must not exceed the device queue depth ({})",
                    name, kickstart, self.device_queue_depth
                ));
            }
        }
        if self.delay_ms > MAX_DELAY_MS {
            return Err(format!(
                "Invalid delay: {} ms. Maximum is {} ms",
                self.delay_ms, MAX_DELAY_MS
            ));
        }
        if !(0.0..=1.0).contains(&self.decay) {
            return Err(format!(
                "Invalid decay: {}. Valid range is 0.0 - 1.0",
                self.decay
            ));
        }
        Ok(())
    }

    /// PCM layout derived from this configuration
    pub fn sample_format(&self) -> SampleFormat {
        SampleFormat::new(self.sample_rate, self.channels, self.frames_per_buffer)
    }
}

/// Get the configuration directory path
///
/// Returns None if the configuration directory cannot be determined.
fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the default configuration file path
///
/// Returns None if the configuration directory cannot be determined.
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Load configuration from `path`
///
/// Missing fields take their default values; the result is validated.
pub fn load_config(path: &Path) -> Result<EchoConfig, String> {
    let content = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file at {:?}: {}", path, e))?;

    let config: EchoConfig =
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file: {}", e))?;

    config.validate()?;

    Ok(config)
}

/// Load from `path`, or from the default location when `path` is None
///
/// A missing default file yields the defaults; an explicit path must exist.
pub fn load_or_default(path: Option<&Path>) -> Result<EchoConfig, String> {
    match path {
        Some(path) => load_config(path),
        None => match default_config_path() {
            Some(path) if path.exists() => load_config(&path),
            _ => Ok(EchoConfig::default()),
        },
    }
}

/// Save configuration to `path`
///
/// Creates the parent directory if it doesn't exist.
pub fn save_config(config: &EchoConfig, path: &Path) -> Result<(), String> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory {:?}: {}", dir, e))?;
        }
    }

    let content =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(path, content)
        .map_err(|e| format!("Failed to write config file {:?}: {}", path, e))?;

    Ok(())
}
