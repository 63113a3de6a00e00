//! Install receipts
//!
//! One TOML file per installed formula under `<prefix>/var/formula/receipts/`.
//!
//! ```toml
//! # aetherlang.toml - written by formula, do not edit manually
//!
//! name = "aetherlang"
//! version = "1.1.0"
//! sha256 = "0019dfc4..."
//! url = "https://github.com/.../v1.1.0/aeth"
//! installed_at = 1760572800
//! installed_files = ["/usr/local/bin/aeth"]
//! ```

use crate::core::config::Settings;
use crate::core::error::InstallError;
use crate::formula::Formula;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub url: String,
    /// Seconds since the Unix epoch
    #[serde(default)]
    pub installed_at: u64,
    pub installed_files: Vec<PathBuf>,
}

impl Receipt {
    pub fn new(formula: &Formula, installed_files: Vec<PathBuf>) -> Self {
        let installed_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            name: formula.name.clone(),
            version: formula.version.clone(),
            sha256: formula.sha256.to_string(),
            url: formula.url.clone(),
            installed_at,
            installed_files,
        }
    }

    /// Receipt location for a formula name
    pub fn path(settings: &Settings, name: &str) -> PathBuf {
        settings.receipts_dir().join(format!("{}.toml", name))
    }

    /// Read receipt from path
    pub fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read receipt: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse receipt: {}", path.display()))
    }

    /// Load the receipt for `name`, if the formula is installed
    pub fn load(settings: &Settings, name: &str) -> Result<Option<Self>> {
        let path = Self::path(settings, name);
        if !path.exists() {
            return Ok(None);
        }
        Self::read(&path).map(Some)
    }

    /// Write the receipt atomically, replacing any previous one.
    pub fn write(&self, settings: &Settings) -> Result<PathBuf, InstallError> {
        let dir = settings.receipts_dir();
        std::fs::create_dir_all(&dir).map_err(|e| InstallError::fs(&dir, e))?;
        let path = Self::path(settings, &self.name);

        let content = toml::to_string_pretty(self)
            .map_err(|e| InstallError::fs(&path, format!("cannot serialize receipt: {}", e)))?;
        let header = format!(
            "# {}.toml - written by formula, do not edit manually\n\n",
            self.name
        );

        let mut tmp =
            tempfile::NamedTempFile::new_in(&dir).map_err(|e| InstallError::fs(&dir, e))?;
        tmp.write_all(header.as_bytes())
            .and_then(|_| tmp.write_all(content.as_bytes()))
            .map_err(|e| InstallError::fs(&path, e))?;
        tmp.persist(&path).map_err(|e| InstallError::fs(&path, e.error))?;
        Ok(path)
    }

    /// Same version and checksum as `formula`
    pub fn matches(&self, formula: &Formula) -> bool {
        self.version == formula.version && formula.sha256.matches(&self.sha256)
    }

    /// Every recorded file is still present
    pub fn is_intact(&self) -> bool {
        self.installed_files.iter().all(|p| p.is_file())
    }

    /// Delete the receipt for `name`. A missing receipt is not an error.
    pub fn remove(settings: &Settings, name: &str) -> Result<()> {
        let path = Self::path(settings, name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove receipt: {}", path.display()))
            }
        }
    }
}

/// All receipts in the prefix, sorted by name. Unreadable receipts are skipped.
pub fn list(settings: &Settings) -> Result<Vec<Receipt>> {
    let dir = settings.receipts_dir();
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut receipts = Vec::new();
    for entry in std::fs::read_dir(&dir)
        .with_context(|| format!("Failed to read receipts directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|e| e == "toml")
            && let Ok(receipt) = Receipt::read(&path)
        {
            receipts.push(receipt);
        }
    }
    receipts.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(receipts)
}
