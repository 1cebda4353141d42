// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional. A missing file yields defaults; a broken file
// logs a warning and also yields defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetsConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Forge".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "vulkan" or "headless"
    pub backend: String,
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Per-frame fence wait budget. `None` waits forever.
    pub fence_timeout_ms: Option<u64>,
    /// Vertices each frame slot can draw
    pub vertex_capacity: u64,
    /// Indices each frame slot can draw
    pub index_capacity: u64,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: "vulkan".to_string(),
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.2, 1.0],
            max_frames_in_flight: 2,
            fence_timeout_ms: None,
            vertex_capacity: 1024 * 1024,
            index_capacity: 1024 * 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
    /// Show frames per second in the window title
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "frame_forge.log".to_string(),
            show_fps: true,
        }
    }
}

/// Where collaborator assets live on disk
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub shader_dir: PathBuf,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("assets/shaders"),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }

    /// Fence wait timeout in nanoseconds, as the driver expects it
    pub fn fence_timeout(&self) -> u64 {
        self.graphics
            .fence_timeout_ms
            .map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000))
    }

    /// Log filter derived from `debug.log_level`
    pub fn log_level(&self) -> log::LevelFilter {
        self.debug
            .log_level
            .parse()
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.fence_timeout(), u64::MAX);
        assert_eq!(config.assets.shader_dir, PathBuf::from("assets/shaders"));
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            max_frames_in_flight = 3
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 3);
        assert_eq!(config.fence_timeout(), 250_000_000);
        assert_eq!(config.graphics.present_mode, "mailbox");
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn test_present_mode_parsing() {
        let mut config = Config::default();
        config.graphics.present_mode = "FIFO_relaxed".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
        config.graphics.present_mode = "vsync-please".to_string();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn test_log_level_falls_back_to_info() {
        let mut config = Config::default();
        config.debug.log_level = "trace".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Trace);
        config.debug.log_level = "loud".to_string();
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.window.title, "Frame Forge");
    }

    #[test]
    fn test_malformed_file_is_error() {
        let path = std::env::temp_dir().join("frame_forge_bad_config.toml");
        std::fs::write(&path, "[window\nwidth = ").unwrap();
        assert!(Config::load_from_path(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
