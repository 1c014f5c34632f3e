//! Configuration management for DualCapture

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::acquisition::AcquisitionParams;
use crate::reconstruct::RenderParams;
use crate::schedule::ColoringMethod;
use crate::transport::{AccumulatorParams, ConflictPolicy};

/// Preferred capture format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CaptureFormat {
    /// Prefer MJPEG (lower bandwidth, needed for high resolutions over USB)
    #[default]
    Mjpeg,
    /// Prefer YUYV (uncompressed, no JPEG artifacts in measurements)
    Yuyv,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub device: String,
    /// Resolution requested from the device
    pub capture_width: u32,
    pub capture_height: u32,
    pub fps: u32,
    /// Working resolution every frame is resized to
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub format: CaptureFormat,
    /// Buffered frames dropped before each read so the frame shows the current pattern
    #[serde(default = "default_discard_frames")]
    pub discard_frames: u32,
    /// V4L2 control values by normalized control name,
    /// e.g. "auto_exposure" -> 1, "exposure_time_absolute" -> 300
    #[serde(default)]
    pub controls: HashMap<String, i64>,
}

fn default_discard_frames() -> u32 {
    2
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            capture_width: 1920,
            capture_height: 1080,
            fps: 30,
            width: 960,
            height: 540,
            format: CaptureFormat::default(),
            discard_frames: default_discard_frames(),
            controls: HashMap::new(),
        }
    }
}

/// Projector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectorConfig {
    /// v4l2loopback device shown fullscreen on the projector
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Wait after each pattern before the camera is read
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_settle_ms() -> u64 {
    200
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video10".to_string(),
            width: 1280,
            height: 720,
            settle_ms: default_settle_ms(),
        }
    }
}

/// Adaptive acquisition settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Below this, a pixel is considered unlit
    pub zero_threshold: f32,
    /// Below this, there is not enough energy to subdivide
    pub subdivision_threshold: f32,
    /// Maximum number of capture rounds
    pub max_depth: usize,
    #[serde(default)]
    pub coloring: ColoringMethod,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// Directory receiving the transport archive and prime image
    pub output_dir: PathBuf,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            zero_threshold: 0.01,
            subdivision_threshold: 0.05,
            max_depth: 14,
            coloring: ColoringMethod::default(),
            conflict_policy: ConflictPolicy::default(),
            output_dir: PathBuf::from("capture"),
        }
    }
}

impl AcquisitionConfig {
    pub fn params(&self) -> AcquisitionParams {
        AcquisitionParams {
            max_depth: self.max_depth,
            accumulator: AccumulatorParams {
                zero_threshold: self.zero_threshold,
                subdivision_threshold: self.subdivision_threshold,
                conflict_policy: self.conflict_policy,
            },
            coloring: self.coloring,
        }
    }
}

/// Dual image rendering settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    /// Deepest quadtree level blended into the dual image
    pub max_level: usize,
    /// Output is raised to 1/gamma
    pub gamma: f64,
    /// Rendered image path, relative to the capture directory unless absolute
    pub output: PathBuf,
}

impl Default for RenderConfig {
    fn default() -> Self {
        let params = RenderParams::default();
        Self {
            max_level: params.max_level,
            gamma: params.gamma,
            output: PathBuf::from("dual_image.png"),
        }
    }
}

impl RenderConfig {
    pub fn params(&self) -> RenderParams {
        RenderParams {
            max_level: self.max_level,
            gamma: self.gamma,
        }
    }
}

/// Acquisition monitor web server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,

    #[serde(default)]
    pub projector: ProjectorConfig,

    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Config {
    /// Load configuration from a file, or create default if it doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config from {:?}", path))?;
            config.validate()?;
            tracing::info!("Loaded configuration from {:?}", path);
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!("Created default configuration at {:?}", path);
            Ok(config)
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize configuration")?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory {:?}", parent))?;
            }
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Reject settings the acquisition cannot run with
    pub fn validate(&self) -> Result<()> {
        let acq = &self.acquisition;
        if !(acq.zero_threshold >= 0.0 && acq.zero_threshold <= acq.subdivision_threshold) {
            anyhow::bail!(
                "zero_threshold ({}) must be between 0 and subdivision_threshold ({})",
                acq.zero_threshold,
                acq.subdivision_threshold
            );
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            anyhow::bail!("camera working resolution must be non-zero");
        }
        if self.projector.width == 0 || self.projector.height == 0 {
            anyhow::bail!("projector resolution must be non-zero");
        }
        if self.render.gamma <= 0.0 {
            anyhow::bail!("render gamma must be positive, got {}", self.render.gamma);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera.width, 960);
        assert_eq!(config.camera.height, 540);
        assert_eq!(config.projector.width, 1280);
        assert_eq!(config.acquisition.max_depth, 14);
        assert_eq!(config.render.max_level, 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [acquisition]
            zero_threshold = 0.02
            subdivision_threshold = 0.1
            max_depth = 8
            coloring = "sequential"
            conflict_policy = "skip"
            output_dir = "run1"
            "#,
        )
        .unwrap();

        let params = config.acquisition.params();
        assert_eq!(params.max_depth, 8);
        assert_eq!(params.coloring, ColoringMethod::Sequential);
        assert_eq!(params.accumulator.conflict_policy, ConflictPolicy::Skip);
        assert_eq!(params.accumulator.subdivision_threshold, 0.1);
        assert_eq!(config.camera.discard_frames, 2);
        assert_eq!(config.projector.settle_ms, 200);
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = Config::default();
        config.acquisition.zero_threshold = 0.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("dualcapture-config-{}.toml", std::process::id()));
        let mut config = Config::default();
        config.camera.controls.insert("auto_exposure".to_string(), 1);
        config.save(&path).unwrap();

        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(loaded.camera.controls.get("auto_exposure"), Some(&1));
        std::fs::remove_file(&path).ok();
    }
}
