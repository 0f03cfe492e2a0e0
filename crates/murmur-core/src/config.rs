//! Configuration system for Murmur.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MURMUR_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/murmur/config.toml
//!   3. ~/.config/murmur/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::crypto::CipherSuite;
use crate::message::MAX_INTEREST;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MurmurConfig {
    pub protocol: ProtocolConfig,
    pub dispatch: DispatchConfig,
    pub density: DensityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Where attachments received from peers are written.
    pub attachment_dir: PathBuf,
    /// Largest file accepted in a File block, in bytes.
    pub max_file_size: u64,
    /// Chunk size for streamed file I/O.
    pub io_chunk_size: usize,
    /// Suite used when pushing to private groups.
    pub default_cipher: CipherSuite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Candidates must score strictly above this value.
    pub threshold: f32,
    pub weights: ScoringWeights,
    /// Highest interest level a contact can declare.
    pub max_interest: u8,
    /// Pending notifications per dispatcher before new ones are dropped.
    pub event_queue_capacity: usize,
    /// Pause after a failed send before the next pick.
    pub retry_backoff_ms: u64,
}

/// Weights of the three score components. The sum is multiplied by age.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub relevance: f32,
    pub density: f32,
    pub quality: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    /// Trailing window over which copies of a status are counted.
    pub window_secs: u64,
    /// How often expired observations are dropped.
    pub prune_interval_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attachment_dir: data_dir().join("attachments"),
            max_file_size: 16 * 1024 * 1024,
            io_chunk_size: 4096,
            default_cipher: CipherSuite::Aes256Cbc,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            threshold: 0.0,
            weights: ScoringWeights::default(),
            max_interest: MAX_INTEREST,
            event_queue_capacity: 256,
            retry_backoff_ms: 500,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            relevance: 0.2,
            density: 0.5,
            quality: 0.3,
        }
    }
}

impl ScoringWeights {
    /// Weights deployed devices were seen using: interest relevance off.
    pub fn observed() -> Self {
        Self {
            relevance: 0.0,
            density: 0.6,
            quality: 0.4,
        }
    }
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            window_secs: 3600,
            prune_interval_secs: 60,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("murmur")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("murmur")
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MurmurConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, falling back to defaults when absent.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            MurmurConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MURMUR_CONFIG")
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
            let text = toml::to_string_pretty(&MurmurConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MURMUR_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("MURMUR_PROTOCOL__ATTACHMENT_DIR") {
            self.protocol.attachment_dir = PathBuf::from(v);
        }
        if let Some(v) = var("MURMUR_PROTOCOL__MAX_FILE_SIZE").and_then(|v| v.parse().ok()) {
            self.protocol.max_file_size = v;
        }
        if let Some(v) = var("MURMUR_PROTOCOL__IO_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.protocol.io_chunk_size = v;
        }
        if let Some(v) = var("MURMUR_PROTOCOL__DEFAULT_CIPHER") {
            match v.as_str() {
                "aes-256-cbc" => self.protocol.default_cipher = CipherSuite::Aes256Cbc,
                "chacha20-poly1305" => {
                    self.protocol.default_cipher = CipherSuite::ChaCha20Poly1305
                }
                other => tracing::warn!(value = other, "unknown cipher override ignored"),
            }
        }
        if let Some(v) = var("MURMUR_DISPATCH__THRESHOLD").and_then(|v| v.parse().ok()) {
            self.dispatch.threshold = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__WEIGHTS__RELEVANCE").and_then(|v| v.parse().ok()) {
            self.dispatch.weights.relevance = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__WEIGHTS__DENSITY").and_then(|v| v.parse().ok()) {
            self.dispatch.weights.density = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__WEIGHTS__QUALITY").and_then(|v| v.parse().ok()) {
            self.dispatch.weights.quality = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__MAX_INTEREST").and_then(|v| v.parse().ok()) {
            self.dispatch.max_interest = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__EVENT_QUEUE_CAPACITY").and_then(|v| v.parse().ok()) {
            self.dispatch.event_queue_capacity = v;
        }
        if let Some(v) = var("MURMUR_DISPATCH__RETRY_BACKOFF_MS").and_then(|v| v.parse().ok()) {
            self.dispatch.retry_backoff_ms = v;
        }
        if let Some(v) = var("MURMUR_DENSITY__WINDOW_SECS").and_then(|v| v.parse().ok()) {
            self.density.window_secs = v;
        }
        if let Some(v) = var("MURMUR_DENSITY__PRUNE_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.density.prune_interval_secs = v;
        }
    }
}
