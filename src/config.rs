// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub app: AppConfig,
    pub instance: InstanceConfig,
    pub frames: FrameConfig,
    pub window: WindowConfig,
    pub debug: DebugConfig,
    pub shaders: ShaderConfig,
}

/// Application metadata reported to the driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub version: [u32; 3],
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "vk-registry".to_string(),
            version: [0, 1, 0],
        }
    }
}

/// Extra instance requirements on top of the default-init set
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub extensions: Vec<String>,
    pub layers: Vec<String>,
    pub validation_layers: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            layers: Vec::new(),
            validation_layers: true,
        }
    }
}

/// Frame cycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FrameConfig {
    pub frames_in_flight: usize,
    pub gather_timeout_ms: u64,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            gather_timeout_ms: 1000,
        }
    }
}

/// Window settings (demo binary)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub present_mode: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vk-registry demo".to_string(),
            width: 1280,
            height: 720,
            present_mode: "fifo".to_string(),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
            log_file: "vk_registry.log".to_string(),
        }
    }
}

/// Shader loading (demo binary)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub directory: String,
    pub hot_reload: bool,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            directory: "shaders".to_string(),
            hot_reload: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        if config.frames.frames_in_flight == 0 {
            log::warn!("frames_in_flight = 0 is invalid, using 1");
            config.frames.frames_in_flight = 1;
        }
        Ok(config)
    }

    pub fn app_version(&self) -> u32 {
        let [major, minor, patch] = self.app.version;
        vk::make_api_version(0, major, minor, patch)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.frames.gather_timeout_ms)
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or_else(|_| {
            log::warn!("Unknown log level '{}', defaulting to info", self.debug.log_level);
            log::LevelFilter::Info
        })
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.window.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to FIFO",
                    self.window.present_mode
                );
                vk::PresentModeKHR::FIFO
            }
        }
    }
}
