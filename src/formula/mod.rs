//! Formula data model
//!
//! A formula describes one release of one package: where to download it,
//! the SHA-256 it must hash to, which files to place where, and how to smoke
//! test the result. Formulas are immutable once loaded; a new release gets a
//! new formula.

pub mod audit;
pub mod loader;

pub use audit::{Finding, Severity, audit, has_errors};
pub use loader::{load_formula, load_formula_str};

use crate::core::error::FormulaError;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// SHA-256 of empty input, a common copy-paste placeholder
const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A package description loaded from a formula file
#[derive(Debug, Clone, Serialize)]
pub struct Formula {
    pub name: String,
    pub desc: Option<String>,
    pub homepage: Option<String>,
    pub version: String,
    pub license: Option<String>,
    pub url: String,
    pub sha256: Sha256Digest,
    pub install: Vec<InstallTarget>,
    pub test: Option<VerifyCommand>,
    /// Formula file this was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Formula {
    /// Final path segment of the download URL
    pub fn artifact_name(&self) -> &str {
        let without_query = self.url.split(['?', '#']).next().unwrap_or(self.url.as_str());
        without_query
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or(self.name.as_str())
    }

    /// `name version`, for messages
    pub fn label(&self) -> String {
        format!("{} {}", self.name, self.version)
    }
}

/// A lowercase hex-encoded SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Parse a 64-character hex digest. Case is ignored and normalized to lowercase.
    pub fn parse(s: &str) -> Result<Self, FormulaError> {
        let s = s.trim();
        if s.len() != 64 {
            return Err(FormulaError::InvalidField {
                field: "sha256",
                reason: format!("expected 64 hex characters, got {}", s.len()),
            });
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FormulaError::InvalidField {
                field: "sha256",
                reason: format!("not a hex string: {}", s),
            });
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a hex string
    pub fn matches(&self, hex_digest: &str) -> bool {
        self.0.eq_ignore_ascii_case(hex_digest.trim())
    }

    /// True for digests that were obviously never computed from a real file:
    /// one hex digit repeated, or the digest of empty input.
    pub fn is_placeholder(&self) -> bool {
        let mut chars = self.0.chars();
        let first = chars.next();
        let repeated = first.is_some_and(|f| chars.all(|c| c == f));
        repeated || self.0 == EMPTY_SHA256
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Sha256Digest> for String {
    fn from(d: Sha256Digest) -> Self {
        d.0
    }
}

/// Where an installed file lands, relative to the prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    Bin,
    Sbin,
    Libexec,
    Lib,
    Share,
    Etc,
}

impl DestinationKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bin" => Some(Self::Bin),
            "sbin" => Some(Self::Sbin),
            "libexec" => Some(Self::Libexec),
            "lib" => Some(Self::Lib),
            "share" => Some(Self::Share),
            "etc" => Some(Self::Etc),
            _ => None,
        }
    }

    /// Subdirectory of the prefix
    pub fn subdir(self) -> &'static str {
        match self {
            Self::Bin => "bin",
            Self::Sbin => "sbin",
            Self::Libexec => "libexec",
            Self::Lib => "lib",
            Self::Share => "share",
            Self::Etc => "etc",
        }
    }

    /// Permission bits used unless a target overrides them
    pub fn default_mode(self) -> u32 {
        match self {
            Self::Bin | Self::Sbin | Self::Libexec => 0o755,
            Self::Lib | Self::Share | Self::Etc => 0o644,
        }
    }
}

/// One file to install
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallTarget {
    /// For a flat artifact: the installed file name. For an archive: the
    /// path (or glob) of the file inside the unpacked archive.
    pub file: String,
    pub to: DestinationKind,
    /// Install under a different name
    pub rename: Option<String>,
    pub mode: Option<u32>,
}

impl InstallTarget {
    pub fn bin(file: &str) -> Self {
        Self {
            file: file.to_string(),
            to: DestinationKind::Bin,
            rename: None,
            mode: None,
        }
    }

    /// File name the target is installed under
    pub fn installed_name(&self) -> &str {
        match self.rename.as_deref() {
            Some(name) => name,
            None => self.file.rsplit('/').next().unwrap_or(self.file.as_str()),
        }
    }

    /// Path relative to the prefix
    pub fn relative_dest(&self) -> PathBuf {
        PathBuf::from(self.to.subdir()).join(self.installed_name())
    }

    pub fn effective_mode(&self) -> u32 {
        self.mode.unwrap_or_else(|| self.to.default_mode())
    }
}

/// Post-install smoke test
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Text that must appear in stdout or stderr
    pub expect_output: Option<String>,
}

impl fmt::Display for VerifyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Validate a package name to prevent path traversal attacks
pub fn validate_package_name(package: &str) -> anyhow::Result<()> {
    if package.is_empty() {
        anyhow::bail!("Package name cannot be empty");
    }

    // Names become file names (receipts, locks, cache entries)
    if !package
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!(
            "Invalid package name '{}': only alphanumeric characters, underscores, and hyphens are allowed",
            package
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const AETH_SHA: &str = "0019dfc4b32d63c1392aa264aed2253c1e0c2fb09216f8e2cc269bbfb8bb49b5";

    fn sample() -> Formula {
        Formula {
            name: "aetherlang".into(),
            desc: None,
            homepage: None,
            version: "1.1.0".into(),
            license: None,
            url: "https://github.com/iamvirul/Aetherlang/releases/download/v1.1.0/aeth".into(),
            sha256: Sha256Digest::parse(AETH_SHA).unwrap(),
            install: vec![InstallTarget::bin("aeth")],
            test: None,
            source: None,
        }
    }

    #[test]
    fn test_digest_normalized_to_lowercase() {
        let d = Sha256Digest::parse(&AETH_SHA.to_uppercase()).unwrap();
        assert_eq!(d.as_str(), AETH_SHA);
        assert!(d.matches(&AETH_SHA.to_uppercase()));
    }

    #[test]
    fn test_digest_rejects_bad_length_and_chars() {
        assert!(Sha256Digest::parse("abc").is_err());
        let not_hex = "z".repeat(64);
        assert!(Sha256Digest::parse(&not_hex).is_err());
    }

    #[test]
    fn test_placeholder_detection() {
        assert!(Sha256Digest::parse(&"0".repeat(64)).unwrap().is_placeholder());
        assert!(Sha256Digest::parse(&"f".repeat(64)).unwrap().is_placeholder());
        assert!(Sha256Digest::parse(EMPTY_SHA256).unwrap().is_placeholder());
        assert!(!Sha256Digest::parse(AETH_SHA).unwrap().is_placeholder());
    }

    #[test]
    fn test_artifact_name() {
        let mut f = sample();
        assert_eq!(f.artifact_name(), "aeth");
        f.url = "https://example.com/dl/aeth-1.1.0.tar.gz?raw=1".into();
        assert_eq!(f.artifact_name(), "aeth-1.1.0.tar.gz");
    }

    #[test]
    fn test_install_target_paths() {
        let t = InstallTarget::bin("aeth");
        assert_eq!(t.relative_dest(), PathBuf::from("bin/aeth"));
        assert_eq!(t.effective_mode(), 0o755);

        let t = InstallTarget {
            file: "aeth-1.1.0/docs/aeth.txt".into(),
            to: DestinationKind::Share,
            rename: None,
            mode: None,
        };
        assert_eq!(t.relative_dest(), PathBuf::from("share/aeth.txt"));
        assert_eq!(t.effective_mode(), 0o644);

        let t = InstallTarget {
            file: "aeth".into(),
            to: DestinationKind::Libexec,
            rename: Some("aeth-runtime".into()),
            mode: Some(0o700),
        };
        assert_eq!(t.relative_dest(), PathBuf::from("libexec/aeth-runtime"));
        assert_eq!(t.effective_mode(), 0o700);
    }

    #[test]
    fn test_destination_kind_round_trip() {
        for kind in ["bin", "sbin", "libexec", "lib", "share", "etc"] {
            assert_eq!(DestinationKind::parse(kind).unwrap().subdir(), kind);
        }
        assert!(DestinationKind::parse("usr").is_none());
    }

    #[test]
    fn test_verify_command_display() {
        let cmd = VerifyCommand {
            program: "aeth".into(),
            args: vec!["--version".into()],
            expect_output: None,
        };
        assert_eq!(cmd.to_string(), "aeth --version");
    }

    #[test]
    fn test_valid_package_names() {
        assert!(validate_package_name("aetherlang").is_ok());
        assert!(validate_package_name("my-package").is_ok());
        assert!(validate_package_name("my_package2").is_ok());
    }

    #[test]
    fn test_invalid_package_names() {
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("..").is_err());
        assert!(validate_package_name("../etc/passwd").is_err());
        assert!(validate_package_name("pkg.name").is_err());
        assert!(validate_package_name("pkg name").is_err());
        assert!(
            validate_package_name("a/b")
                .unwrap_err()
                .to_string()
                .contains("Invalid package name")
        );
    }
}
