//! Service configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file, then
//! `CODESCAN_*` environment variables. The binary applies command-line flags
//! on top.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::preprocess::PreprocessConfig;

pub const ENV_VISION_API_KEY: &str = "CODESCAN_VISION_API_KEY";
pub const ENV_VISION_URL: &str = "CODESCAN_VISION_URL";
pub const ENV_VISION_MODEL: &str = "CODESCAN_VISION_MODEL";
pub const ENV_VISION_TIMEOUT_SECS: &str = "CODESCAN_VISION_TIMEOUT_SECS";
pub const ENV_MAX_UPLOAD_BYTES: &str = "CODESCAN_MAX_UPLOAD_BYTES";
pub const ENV_SCRATCH_DIR: &str = "CODESCAN_SCRATCH_DIR";
pub const ENV_REQUEST_DEADLINE_SECS: &str = "CODESCAN_REQUEST_DEADLINE_SECS";
pub const ENV_MAX_EDGE: &str = "CODESCAN_MAX_EDGE";
pub const ENV_JPEG_QUALITY: &str = "CODESCAN_JPEG_QUALITY";

/// Configuration error type.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// An environment variable held an unparseable value.
    #[error("Invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },
    /// A setting is outside its allowed range.
    #[error("Invalid setting {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// External vision-model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Bearer credential. The fallback is disabled when unset.
    pub api_key: Option<String>,
    /// Chat-completions endpoint URL.
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 20,
        }
    }
}

impl VisionConfig {
    pub fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Decode service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub vision: VisionConfig,
    pub preprocess: PreprocessConfig,
    /// Largest accepted upload, enforced by the HTTP layer.
    pub max_upload_bytes: usize,
    /// Root of the per-request scratch directories.
    pub scratch_dir: PathBuf,
    /// Overall per-request budget. Remaining strategies are skipped once exceeded.
    pub request_deadline_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            vision: VisionConfig::default(),
            preprocess: PreprocessConfig::default(),
            max_upload_bytes: 10 * 1024 * 1024,
            scratch_dir: default_scratch_dir(),
            request_deadline_secs: None,
        }
    }
}

impl ServiceConfig {
    pub fn request_deadline(&self) -> Option<Duration> {
        self.request_deadline_secs.map(Duration::from_secs)
    }

    /// Apply `CODESCAN_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_lookup(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_lookup<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(ENV_VISION_API_KEY) {
            self.vision.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        if let Some(url) = lookup(ENV_VISION_URL) {
            self.vision.endpoint = url;
        }
        if let Some(model) = lookup(ENV_VISION_MODEL) {
            self.vision.model = model;
        }
        if let Some(v) = lookup(ENV_VISION_TIMEOUT_SECS) {
            self.vision.timeout_secs = parse_env(ENV_VISION_TIMEOUT_SECS, v)?;
        }
        if let Some(v) = lookup(ENV_MAX_UPLOAD_BYTES) {
            self.max_upload_bytes = parse_env(ENV_MAX_UPLOAD_BYTES, v)?;
        }
        if let Some(dir) = lookup(ENV_SCRATCH_DIR) {
            self.scratch_dir = PathBuf::from(dir);
        }
        if let Some(v) = lookup(ENV_REQUEST_DEADLINE_SECS) {
            self.request_deadline_secs = Some(parse_env(ENV_REQUEST_DEADLINE_SECS, v)?);
        }
        if let Some(v) = lookup(ENV_MAX_EDGE) {
            self.preprocess.max_edge = parse_env(ENV_MAX_EDGE, v)?;
        }
        if let Some(v) = lookup(ENV_JPEG_QUALITY) {
            self.preprocess.jpeg_quality = parse_env(ENV_JPEG_QUALITY, v)?;
        }
        Ok(())
    }

    /// Reject settings that would make the service misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_upload_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.vision.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "vision.timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.request_deadline_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "request_deadline_secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if !(1..=100).contains(&self.preprocess.jpeg_quality) {
            return Err(ConfigError::Invalid {
                field: "preprocess.jpeg_quality",
                reason: format!("{} is outside 1-100", self.preprocess.jpeg_quality),
            });
        }
        if self.preprocess.max_edge < 64 {
            return Err(ConfigError::Invalid {
                field: "preprocess.max_edge",
                reason: format!("{} is below the 64px minimum", self.preprocess.max_edge),
            });
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { name, value })
}

/// Platform cache directory for scratch files, or the system temp dir.
pub fn default_scratch_dir() -> PathBuf {
    ProjectDirs::from("", "", "codescan")
        .map(|dirs| dirs.cache_dir().join("scratch"))
        .unwrap_or_else(|| std::env::temp_dir().join("codescan-scratch"))
}

/// Load a JSON configuration file.
pub fn load_config_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Defaults, then the optional JSON file, then the environment. Validated.
pub fn load_config(path: Option<&Path>) -> Result<ServiceConfig, ConfigError> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => ServiceConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}
