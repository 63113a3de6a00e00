//! Installer settings
//!
//! Resolved once by the CLI (flags, then environment, then defaults) and
//! passed down explicitly. Library code never reads the environment itself.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default HTTP timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default installation prefix
pub const DEFAULT_PREFIX: &str = "/usr/local";

/// Resolved settings for one installer run
#[derive(Debug, Clone)]
pub struct Settings {
    /// Installation prefix; kind directories (`bin`, `lib`, ...) live below it
    pub prefix: PathBuf,
    /// Where verified downloads are cached
    pub cache_dir: PathBuf,
    /// Timeout for each HTTP request
    pub http_timeout: Duration,
}

impl Settings {
    pub fn new(prefix: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            prefix: prefix.into(),
            cache_dir: cache_dir.into(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }

    /// Set the HTTP timeout, clamped to a reasonable range (5-300 seconds)
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.http_timeout = Duration::from_secs(secs.clamp(5, 300));
        self
    }

    /// Directory holding install receipts
    pub fn receipts_dir(&self) -> PathBuf {
        self.prefix.join("var/formula/receipts")
    }

    /// Directory for verified downloads
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    /// Directory holding per-formula lock files
    pub fn locks_dir(&self) -> PathBuf {
        self.cache_dir.join("locks")
    }

    /// Directory for extracted archives
    pub fn unpack_dir(&self) -> PathBuf {
        self.cache_dir.join("unpack")
    }
}

/// Default formulas directory: `$XDG_DATA_HOME/formula/formulas`
pub fn default_formulas_path() -> PathBuf {
    data_home().join("formula/formulas")
}

/// Default cache directory: `$XDG_CACHE_HOME/formula`
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| home().join(".cache"))
        .join("formula")
}

fn data_home() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| home().join(".local/share"))
}

fn home() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| Path::new(".").to_path_buf())
}
