//! Error types for loading formulas and running installs.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that abort an install.
///
/// Every variant is fatal. Nothing is retried; the failing step is reported
/// and the prefix is left as it was before the install started.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("sha256 integrity check failed for {url}\n  expected: {expected}\n  got:      {actual}")]
    Integrity {
        url: String,
        expected: String,
        actual: String,
    },

    #[error("refusing to trust placeholder checksum {digest} for {name}")]
    UnverifiedChecksum { name: String, digest: String },

    #[error("filesystem error at {}: {reason}", .path.display())]
    Filesystem { path: PathBuf, reason: String },

    #[error("verification command `{command}` failed: {reason}")]
    Verification { command: String, reason: String },
}

impl InstallError {
    pub(crate) fn network(url: &str, reason: impl ToString) -> Self {
        Self::Network {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn fs(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::Filesystem {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Short name of the pipeline step that produced this error
    pub fn step(&self) -> &'static str {
        match self {
            Self::Network { .. } => "fetch",
            Self::Integrity { .. } | Self::UnverifiedChecksum { .. } => "verify",
            Self::Filesystem { .. } => "install",
            Self::Verification { .. } => "test",
        }
    }
}

/// Errors that can occur while reading a formula file.
#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("cannot read formula {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("formula script error: {0}")]
    Script(String),

    #[error("missing required variable: {0}")]
    MissingField(&'static str),

    #[error("invalid `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        assert_eq!(InstallError::network("u", "down").step(), "fetch");
        assert_eq!(
            InstallError::Integrity {
                url: "u".into(),
                expected: "a".into(),
                actual: "b".into()
            }
            .step(),
            "verify"
        );
        assert_eq!(InstallError::fs("/x", "denied").step(), "install");
        assert_eq!(
            InstallError::Verification {
                command: "aeth --version".into(),
                reason: "exit code 1".into()
            }
            .step(),
            "test"
        );
    }

    #[test]
    fn test_integrity_message_shows_both_digests() {
        let err = InstallError::Integrity {
            url: "https://example.com/aeth".into(),
            expected: "aaaa".into(),
            actual: "bbbb".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("integrity check failed"));
        assert!(msg.contains("expected: aaaa"));
        assert!(msg.contains("got:      bbbb"));
    }
}
