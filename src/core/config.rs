//! Engine configuration management

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error_handling::RetryPolicy;

/// Main engine configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub download: DownloadSettings,
    pub hls: HlsSettings,
    pub logging: LoggingConfig,
}

/// Per-job transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSettings {
    /// Parts downloaded in parallel when the job has no preferred count
    pub default_connections: u32,
    /// Retries per part after the first attempt
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between part retries
    pub retry_base_delay_ms: u64,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    pub user_agent: String,
    /// Single-file jobs smaller than this are not split
    pub min_split_size: u64,
}

/// Playlist / segment handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HlsSettings {
    /// Upper bound on concurrent segment length probes
    pub probe_concurrency: usize,
    pub remux: RemuxStrategy,
    /// ffmpeg binary, resolved through PATH when relative
    pub ffmpeg_path: String,
    /// Appended to the final path to name the segment directory
    pub parts_dir_suffix: String,
    pub segment_extension: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemuxStrategy {
    /// Stream-copy through an external ffmpeg process
    Ffmpeg,
    /// Plain MPEG-TS byte concatenation
    Concat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub log_level: String, // "error", "warn", "info", "debug", "trace"
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            default_connections: 4,
            retry_attempts: 3,
            retry_base_delay_ms: 500,
            timeout_seconds: 30,
            user_agent: "VideoSegmentDownloader/1.0.0".to_string(),
            min_split_size: 1024 * 1024, // 1MB
        }
    }
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            probe_concurrency: 8,
            remux: RemuxStrategy::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            parts_dir_suffix: "-parts".to_string(),
            segment_extension: "ts".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl DownloadSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            ..Default::default()
        }
    }
}

impl EngineConfig {
    /// Load configuration from file, creating default if not exists
    pub fn load() -> Result<Self> {
        let config_path = Self::get_config_path()?;

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

            let config: EngineConfig =
                serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;

            tracing::info!("Loaded configuration from: {:?}", config_path);
            Ok(config)
        } else {
            let config = Self::default();
            config.save()?;
            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content =
            serde_json::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;

        tracing::info!("Saved configuration to: {:?}", config_path);
        Ok(())
    }

    pub fn load_from(config_path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;
        let config: EngineConfig =
            serde_json::from_str(&content).with_context(|| "Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Get the path to the configuration file
    pub fn get_config_path() -> Result<PathBuf> {
        let project_dirs = ProjectDirs::from("com", "videodownloader", "segment-downloader")
            .with_context(|| "Failed to get project directories")?;

        Ok(project_dirs.config_dir().join("config.json"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.default_connections == 0 {
            bail!("download.default_connections must be at least 1");
        }
        if self.download.timeout_seconds == 0 {
            bail!("download.timeout_seconds must be positive");
        }
        if self.hls.probe_concurrency == 0 {
            bail!("hls.probe_concurrency must be at least 1");
        }
        if self.hls.segment_extension.is_empty() || self.hls.segment_extension.contains('.') {
            bail!(
                "hls.segment_extension must be a bare extension, got {:?}",
                self.hls.segment_extension
            );
        }
        if self.hls.parts_dir_suffix.is_empty() {
            bail!("hls.parts_dir_suffix must not be empty");
        }
        if self.hls.remux == RemuxStrategy::Ffmpeg && self.hls.ffmpeg_path.trim().is_empty() {
            bail!("hls.ffmpeg_path is required for ffmpeg remuxing");
        }
        if !["error", "warn", "info", "debug", "trace"].contains(&self.logging.log_level.as_str()) {
            bail!("Unknown log level: {}", self.logging.log_level);
        }
        Ok(())
    }
}
