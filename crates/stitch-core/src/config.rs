use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::event::{EventKind, MICROS_PER_SEC};
use crate::fraud::{DEFAULT_PAGE_SIZE, DetectParams};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "stitch.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::ConfigParseError
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StitchConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub reference: ReferenceConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            dir: default_source_dir(),
            extension: default_extension(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_click_code")]
    pub click_code: i64,
    #[serde(default = "default_terminal_code")]
    pub terminal_code: i64,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            click_code: default_click_code(),
            terminal_code: default_terminal_code(),
            timeout_ms: None,
            page_size: default_page_size(),
        }
    }
}

impl FraudConfig {
    /// Scan parameters at `now_us` from these settings.
    #[must_use]
    pub fn detect_params(&self, now_us: i64) -> DetectParams {
        let window_us = i64::try_from(self.window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(MICROS_PER_SEC);
        DetectParams {
            window_us,
            ..DetectParams::at(now_us)
        }
        .with_codes(EventKind(self.click_code), EventKind(self.terminal_code))
        .with_timeout(self.timeout_ms.map(Duration::from_millis))
        .with_page_size(self.page_size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceConfig {
    /// JSON reference file loaded into the store by `reference load`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".stitch/stitch.db")
}

const fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("events")
}

fn default_extension() -> String {
    "jsonl".to_string()
}

const fn default_window_secs() -> u64 {
    86_400
}

const fn default_click_code() -> i64 {
    EventKind::CLICK.code()
}

const fn default_terminal_code() -> i64 {
    EventKind::COMPLETION.code()
}

const fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// Load configuration from `path`. A missing file yields the defaults.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] if the file exists but cannot be read and
/// [`ConfigError::Parse`] if it is not valid TOML for this schema.
pub fn load_config(path: &Path) -> Result<StitchConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        return Ok(StitchConfig::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str::<StitchConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
