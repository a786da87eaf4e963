// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::pipeline::{DISPATCH_TILE, MAX_BLOCK_DIM};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub image: ImageConfig,
    pub compute: ComputeConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings. The window size is also the compute target size.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Haar2D Demo".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Input image
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub path: PathBuf,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg_6.1.1.png"),
        }
    }
}

/// Compute transform settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Compiled SPIR-V of the horizontal Haar shader
    pub shader: PathBuf,
    /// Pixels per transform block, pushed to the shader as `block_dim`
    pub block_dim: u32,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            shader: PathBuf::from("shaders/haar2d_hor.comp.spv"),
            block_dim: 128,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    /// Force a physical device by enumeration index instead of scoring
    pub device_index: Option<usize>,
    /// Bound on the per-frame fence wait. Unset waits forever.
    pub fence_timeout_ms: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "fifo".to_string(),
            device_index: None,
            fence_timeout_ms: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "haar_demo.log".to_string(),
            show_fps: true,
        }
    }
}

/// Where the configuration came from
///
/// Loading happens before logging is set up (the config decides where logs
/// go), so the outcome is kept and reported once the logger exists.
#[derive(Debug)]
pub enum ConfigSource {
    File(PathBuf),
    /// No file at the path, defaults in use
    Missing(PathBuf),
    /// File exists but could not be read or parsed, defaults in use
    Invalid(anyhow::Error),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            ConfigSource::File(path) => log::info!("Loaded configuration from {:?}", path),
            ConfigSource::Missing(path) => {
                log::info!("Config file not found at {:?}, using defaults", path)
            }
            ConfigSource::Invalid(e) => log::warn!("{:#}. Using defaults.", e),
        }
    }
}

impl Config {
    /// Load configuration from config.toml, falling back to defaults
    pub fn load() -> (Self, ConfigSource) {
        Self::load_or_default("config.toml")
    }

    /// Load configuration from `path`, falling back to defaults on any failure
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> (Self, ConfigSource) {
        let path = path.as_ref();
        match Self::load_from_path(path) {
            Ok(Some(config)) => (config, ConfigSource::File(path.to_path_buf())),
            Ok(None) => (Config::default(), ConfigSource::Missing(path.to_path_buf())),
            Err(e) => (Config::default(), ConfigSource::Invalid(e)),
        }
    }

    /// Load configuration from a specific path. `None` if there is no file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Reject values the shader or Vulkan cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            anyhow::bail!(
                "Window size must be non-zero, got {}x{}",
                self.window.width,
                self.window.height
            );
        }

        let block_dim = self.compute.block_dim;
        if !block_dim.is_power_of_two() || !(DISPATCH_TILE..=MAX_BLOCK_DIM).contains(&block_dim) {
            anyhow::bail!(
                "compute.block_dim must be a power of two in {}..={}, got {}",
                DISPATCH_TILE,
                MAX_BLOCK_DIM,
                block_dim
            );
        }

        if self.graphics.fence_timeout_ms == Some(0) {
            anyhow::bail!("graphics.fence_timeout_ms must be positive when set");
        }

        Ok(())
    }

    /// Get present mode as Vulkan enum
    pub fn get_present_mode(&self) -> ash::vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => ash::vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => ash::vk::PresentModeKHR::MAILBOX,
            "fifo" => ash::vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => ash::vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                ash::vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Fence wait timeout in nanoseconds, as Vulkan expects it
    pub fn fence_timeout_ns(&self) -> u64 {
        self.graphics
            .fence_timeout_ms
            .map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    #[test]
    fn defaults_match_demo_setup() {
        let config = Config::default();
        assert_eq!((config.window.width, config.window.height), (800, 600));
        assert_eq!(config.compute.block_dim, 128);
        assert_eq!(config.image.path, PathBuf::from("ffmpeg_6.1.1.png"));
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
        config.validate().unwrap();
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 1024

            [graphics]
            present_mode = "Mailbox"
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 1024);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.window.title, "Haar2D Demo");
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.fence_timeout_ns(), 250_000_000);
        assert_eq!(config.graphics.device_index, None);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_fifo() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-please\"").unwrap();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        assert!(Config::load_from_path("does/not/exist/config.toml").unwrap().is_none());

        let (config, source) = Config::load_or_default("does/not/exist/config.toml");
        assert_eq!(config.window.width, 800);
        assert!(matches!(source, ConfigSource::Missing(_)));
    }

    #[test]
    fn unparsable_file_keeps_the_error_for_later() {
        let path = std::env::temp_dir().join(format!("haar-demo-{}-bad.toml", std::process::id()));
        std::fs::write(&path, "[compute]\nblock_dim = \"large\"\n").unwrap();

        let (config, source) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.compute.block_dim, 128);
        match source {
            ConfigSource::Invalid(e) => assert!(format!("{:#}", e).contains("Failed to parse")),
            other => panic!("expected an invalid source, got {:?}", other),
        }
    }

    #[test]
    fn readable_file_is_reported_as_loaded() {
        let path = std::env::temp_dir().join(format!("haar-demo-{}-good.toml", std::process::id()));
        std::fs::write(&path, "[window]\nheight = 480\n").unwrap();

        let (config, source) = Config::load_or_default(&path);
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.window.height, 480);
        assert!(matches!(source, ConfigSource::File(p) if p == path));
    }

    #[test]
    fn validate_rejects_bad_block_dim() {
        for block_dim in [0, 16, 96, 256] {
            let mut config = Config::default();
            config.compute.block_dim = block_dim;
            assert!(config.validate().is_err(), "block_dim {} accepted", block_dim);
        }

        let mut config = Config::default();
        config.compute.block_dim = 64;
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_empty_window_and_zero_timeout() {
        let mut config = Config::default();
        config.window.height = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.graphics.fence_timeout_ms = Some(0);
        assert!(config.validate().is_err());
    }
}
