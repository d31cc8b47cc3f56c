//! Configuration system for cvpd.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CVPD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cvpd/config.toml
//!   3. ~/.config/cvpd/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::verdict::DEFAULT_INFECTED_PREFIX;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CvpConfig {
    pub server: ServerConfig,
    pub inspection: InspectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the peer listener binds to.
    pub listen: String,
    /// Largest chunk a peer connection will accept in one frame.
    pub max_chunk_size: usize,
    /// Frames queued per connection before sends report backpressure.
    pub outbound_queue_depth: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Preferred size of chunks streamed back to the peer.
    pub chunk_size: usize,
    /// Directory holding per-session scratch files.
    pub scratch_dir: PathBuf,
    /// File name prefix treated as infected by the stand-in policy.
    pub infected_prefix: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub const DEFAULT_PORT: u16 = 18181;
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_chunk_size: 64 * 1024,
            outbound_queue_depth: 8,
        }
    }
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            scratch_dir: std::env::temp_dir().join("cvpd"),
            infected_prefix: DEFAULT_INFECTED_PREFIX.to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cvpd")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl CvpConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            CvpConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CVPD_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&CvpConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inspection.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "inspection.chunk_size",
                "must be greater than zero".into(),
            ));
        }
        if self.server.max_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "server.max_chunk_size",
                "must be greater than zero".into(),
            ));
        }
        if self.server.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "server.outbound_queue_depth",
                "must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply CVPD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CVPD_SERVER__LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("CVPD_SERVER__MAX_CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.server.max_chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("CVPD_INSPECTION__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.inspection.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("CVPD_INSPECTION__SCRATCH_DIR") {
            self.inspection.scratch_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("CVPD_INSPECTION__INFECTED_PREFIX") {
            self.inspection.infected_prefix = v;
        }
    }
}
