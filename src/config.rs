// SPDX-License-Identifier: GPL-3.0-only

//! Persistent configuration
//!
//! Stored as JSON in `<config dir>/edgecam/config.json`. Missing files and
//! missing fields fall back to the defaults in [`crate::constants`].

use crate::backends::camera::pipeline::PipelineSettings;
use crate::backends::camera::session::CapturePolicy;
use crate::backends::camera::virtual_sensor::{VirtualCameraSpec, VirtualSensorSettings};
use crate::backends::camera::{AfMode, FrameSize, PixelFormat};
use crate::constants::{capture, render, timing};
use crate::errors::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Application directory name under the platform config dir
const APP_DIR: &str = "edgecam";
const CONFIG_FILE: &str = "config.json";

/// Capture session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Used when the camera offers exactly this size
    pub preferred_size: FrameSize,
    /// Used when it does not
    pub fallback_size: FrameSize,
    /// Images queued or held at once
    pub max_images: usize,
    /// Attach a preview surface to the session
    pub preview_enabled: bool,
    /// Request continuous autofocus
    pub autofocus: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preferred_size: capture::PREFERRED_SIZE,
            fallback_size: capture::FALLBACK_SIZE,
            max_images: capture::MAX_IMAGES,
            preview_enabled: true,
            autofocus: true,
        }
    }
}

/// Timing settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub fps_report_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub render_rate_hz: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fps_report_interval_ms: timing::FPS_REPORT_INTERVAL.as_millis() as u64,
            shutdown_timeout_ms: timing::SHUTDOWN_TIMEOUT.as_millis() as u64,
            render_rate_hz: timing::RENDER_RATE_HZ,
        }
    }
}

impl TimingConfig {
    pub fn fps_report_interval(&self) -> Duration {
        Duration::from_millis(self.fps_report_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Synthetic sensor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualSensorConfig {
    pub name: String,
    pub framerate: u32,
    pub output_sizes: Vec<FrameSize>,
    pub open_latency_ms: u64,
    pub configure_latency_ms: u64,
    pub supports_autofocus: bool,
}

impl Default for VirtualSensorConfig {
    fn default() -> Self {
        let spec = VirtualCameraSpec::default();
        let settings = VirtualSensorSettings::default();
        Self {
            name: spec.name,
            framerate: spec.framerate,
            output_sizes: spec.output_sizes,
            open_latency_ms: settings.open_latency.as_millis() as u64,
            configure_latency_ms: settings.configure_latency.as_millis() as u64,
            supports_autofocus: spec.supports_autofocus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Camera opened by `run`
    pub camera_id: String,
    pub capture: CaptureConfig,
    pub timing: TimingConfig,
    pub virtual_sensor: VirtualSensorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_id: capture::DEFAULT_CAMERA_ID.to_string(),
            capture: CaptureConfig::default(),
            timing: TimingConfig::default(),
            virtual_sensor: VirtualSensorConfig::default(),
        }
    }
}

impl Config {
    /// Default config file location, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load from `path`; a missing file yields defaults
    pub fn load(path: &Path) -> AppResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load from the default location
    pub fn load_default() -> AppResult<Self> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Write as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> AppResult<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        info!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> AppResult<()> {
        if self.camera_id.trim().is_empty() {
            return Err(AppError::Config("camera_id is empty".into()));
        }
        if self.capture.preferred_size.is_empty() || self.capture.fallback_size.is_empty() {
            return Err(AppError::Config("capture sizes must be non-zero".into()));
        }
        if self.capture.max_images == 0 {
            return Err(AppError::Config("max_images must be at least 1".into()));
        }
        if self.timing.fps_report_interval_ms == 0
            || self.timing.shutdown_timeout_ms == 0
            || self.timing.render_rate_hz == 0
        {
            return Err(AppError::Config("timing values must be non-zero".into()));
        }
        if self.virtual_sensor.framerate == 0 {
            return Err(AppError::Config("virtual sensor framerate must be non-zero".into()));
        }
        if let Some(size) = self.virtual_sensor.output_sizes.iter().find(|s| s.is_empty()) {
            return Err(AppError::Config(format!("invalid sensor size {}", size)));
        }
        Ok(())
    }

    pub fn capture_policy(&self) -> CapturePolicy {
        CapturePolicy {
            preferred_size: self.capture.preferred_size,
            fallback_size: self.capture.fallback_size,
            max_images: self.capture.max_images,
            format: PixelFormat::Yuv420,
            af_mode: if self.capture.autofocus {
                AfMode::ContinuousPicture
            } else {
                AfMode::Off
            },
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            camera_id: self.camera_id.clone(),
            policy: self.capture_policy(),
            shutdown_timeout: self.timing.shutdown_timeout(),
        }
    }

    pub fn sensor_settings(&self) -> VirtualSensorSettings {
        let sensor = &self.virtual_sensor;
        VirtualSensorSettings {
            cameras: vec![VirtualCameraSpec {
                id: self.camera_id.clone(),
                name: sensor.name.clone(),
                output_sizes: sensor.output_sizes.clone(),
                framerate: sensor.framerate,
                supports_autofocus: sensor.supports_autofocus,
            }],
            open_latency: Duration::from_millis(sensor.open_latency_ms),
            configure_latency: Duration::from_millis(sensor.configure_latency_ms),
            ..Default::default()
        }
    }

    /// Capacity of the UI marshaling channel
    pub fn ui_queue_capacity(&self) -> usize {
        render::UI_QUEUE_CAPACITY
    }
}
