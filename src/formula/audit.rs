//! Static checks over a loaded formula
//!
//! Nothing here touches the network or the filesystem. The checks catch
//! mistakes that the install pipeline would otherwise only surface late (or
//! never), such as a URL still pointing at the previous release.

use super::{Formula, validate_package_name};
use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("warning"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A single audit result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub field: &'static str,
    pub message: String,
}

impl Finding {
    fn error(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            field,
            message: message.into(),
        }
    }

    fn warning(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            field,
            message: message.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.field, self.message)
    }
}

/// Run every check. Findings are ordered errors first.
pub fn audit(formula: &Formula) -> Vec<Finding> {
    let mut findings = Vec::new();

    if let Err(e) = validate_package_name(&formula.name) {
        findings.push(Finding::error("name", e.to_string()));
    }

    if let Err(e) = semver::Version::parse(&formula.version) {
        findings.push(Finding::error(
            "version",
            format!("'{}' is not a semantic version: {}", formula.version, e),
        ));
    }

    if !url_embeds_version(&formula.url, &formula.version) {
        findings.push(Finding::error(
            "url",
            format!(
                "version '{}' does not appear in any path segment of {}",
                formula.version, formula.url
            ),
        ));
    }

    if !formula.url.starts_with("https://") {
        findings.push(Finding::warning("url", "download URL is not https"));
    }

    if formula.sha256.is_placeholder() {
        findings.push(Finding::error(
            "sha256",
            format!("{} looks like a placeholder, not a computed digest", formula.sha256),
        ));
    }

    let mut seen = HashSet::new();
    for target in &formula.install {
        let dest = target.relative_dest();
        if !seen.insert(dest.clone()) {
            findings.push(Finding::error(
                "install",
                format!("more than one target installs to {}", dest.display()),
            ));
        }
    }

    match formula.desc.as_deref() {
        Some(d) if !d.trim().is_empty() => {}
        _ => findings.push(Finding::warning("desc", "missing description")),
    }
    match formula.homepage.as_deref() {
        None | Some("") => findings.push(Finding::warning("homepage", "missing homepage")),
        Some(h) if !(h.starts_with("https://") || h.starts_with("http://")) => {
            findings.push(Finding::warning("homepage", format!("not an http(s) URL: {}", h)))
        }
        Some(_) => {}
    }
    match formula.license.as_deref() {
        Some(l) if !l.trim().is_empty() => {}
        _ => findings.push(Finding::warning("license", "missing license")),
    }

    if formula.test.is_none() {
        findings.push(Finding::warning(
            "test",
            "no verification command; installs will not be smoke tested",
        ));
    }

    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    findings
}

/// True if any finding is an error
pub fn has_errors(findings: &[Finding]) -> bool {
    findings.iter().any(|f| f.severity == Severity::Error)
}

/// Does `version` appear as a whole token in a path segment of `url`?
///
/// Only the path counts: a version that shows up in the host name or the
/// query string does not tie the download to the release.
pub fn url_embeds_version(url: &str, version: &str) -> bool {
    if version.is_empty() {
        return false;
    }
    let after_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let without_query = after_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(after_scheme);

    // file:// URLs have an empty host; everything after it is path
    let path = if url.starts_with("file://") {
        without_query
    } else {
        without_query.split_once('/').map(|(_, p)| p).unwrap_or("")
    };

    path.split('/').any(|segment| {
        segment.match_indices(version).any(|(at, _)| {
            starts_cleanly(&segment[..at]) && ends_cleanly(&segment[at + version.len()..])
        })
    })
}

/// Nothing before the match extends the version: `v1.1.0` and `aeth-1.1.0`
/// are fine, `v11.1.0` and `2.1.1.0` are not.
fn starts_cleanly(before: &str) -> bool {
    let mut rev = before.chars().rev();
    match rev.next() {
        None => true,
        Some('v' | 'V') => rev.next().is_none_or(|c| !c.is_ascii_alphanumeric()),
        Some('.') => rev.next().is_none_or(|c| !c.is_ascii_digit()),
        Some(c) => !c.is_ascii_alphanumeric(),
    }
}

/// Nothing after the match extends the version: `1.1.0.tar.gz` and
/// `1.1.0-linux` are fine, `1.1.0.1`, `1.1.0-rc1` and `1.1.0+build` are not.
fn ends_cleanly(after: &str) -> bool {
    let mut chars = after.chars();
    match chars.next() {
        None => true,
        Some('.') => chars.next().is_none_or(|c| !c.is_ascii_digit()),
        Some('-') => !is_prerelease_tag(chars.as_str()),
        Some('+') => false,
        Some(c) => !c.is_ascii_alphanumeric(),
    }
}

fn is_prerelease_tag(rest: &str) -> bool {
    const TAGS: [&str; 7] = ["alpha", "beta", "rc", "pre", "dev", "preview", "snapshot"];
    let token = rest
        .split(['-', '.', '_', '+'])
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();
    if token.is_empty() {
        return false;
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    let word = token.trim_end_matches(|c: char| c.is_ascii_digit());
    TAGS.contains(&word)
}
