//! Artifact download
//!
//! Downloads stream into a uniquely named temp file in the downloads
//! directory while SHA-256 is computed on the fly. Only a verified artifact
//! is persisted under its cache name, so every cache entry has matched its
//! formula once. It is still re-hashed before every reuse.
//!
//! Callers that go on to install the artifact hold the formula lock across
//! fetch and install, so a cache entry cannot change between the two.

use crate::core::config::Settings;
use crate::core::error::InstallError;
use crate::core::output;
use crate::formula::Formula;
use sha2::Digest;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::verify;

const USER_AGENT: &str = concat!("levitate-formula/", env!("CARGO_PKG_VERSION"));

/// A verified artifact in the download cache
#[derive(Debug, Clone)]
pub struct Fetched {
    pub path: PathBuf,
    pub sha256: String,
    pub from_cache: bool,
}

/// Cache location for a formula's artifact
pub fn cache_path(formula: &Formula, settings: &Settings) -> PathBuf {
    settings.downloads_dir().join(format!(
        "{}--{}--{}",
        formula.name,
        formula.version,
        formula.artifact_name()
    ))
}

/// Fetch and verify a formula's artifact.
///
/// Nothing outside the download cache is written. On a checksum mismatch the
/// partial download is deleted before the error is returned.
pub fn fetch(formula: &Formula, settings: &Settings) -> Result<Fetched, InstallError> {
    verify::check_not_placeholder(formula)?;

    let dest = cache_path(formula, settings);
    if dest.is_file() {
        match verify::sha256_file(&dest) {
            Ok(digest) if formula.sha256.matches(&digest) => {
                output::detail(&format!("using cached {}", dest.display()));
                return Ok(Fetched {
                    path: dest,
                    sha256: digest,
                    from_cache: true,
                });
            }
            _ => {
                output::detail("cached download does not match checksum, fetching again");
                std::fs::remove_file(&dest).map_err(|e| InstallError::fs(&dest, e))?;
            }
        }
    }

    let downloads = settings.downloads_dir();
    std::fs::create_dir_all(&downloads).map_err(|e| InstallError::fs(&downloads, e))?;

    // Dropping `part` on any early return deletes the partial download
    let mut part = tempfile::Builder::new()
        .prefix(".formula-")
        .suffix(".part")
        .tempfile_in(&downloads)
        .map_err(|e| InstallError::fs(&downloads, e))?;
    let label = formula.artifact_name();
    let digest = download(&formula.url, part.as_file_mut(), label, settings.http_timeout)
        .map_err(|e| e.at(&dest))?;

    verify::check_digest(formula, &digest)?;
    output::detail(&format!("sha256 ok ({})", digest));

    part.persist(&dest).map_err(|e| InstallError::fs(&dest, e.error))?;
    Ok(Fetched {
        path: dest,
        sha256: digest,
        from_cache: false,
    })
}

/// Download `url` to `dest`, returning the SHA-256 of the bytes written.
///
/// `file://` URLs are read from the local filesystem. A failed download
/// removes `dest`.
pub fn download_to(url: &str, dest: &Path, timeout: Duration) -> Result<String, InstallError> {
    let label = dest
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let mut file = File::create(dest).map_err(|e| InstallError::fs(dest, e))?;
    let result = download(url, &mut file, &label, timeout);
    if result.is_err() {
        drop(file);
        let _ = std::fs::remove_file(dest);
    }
    result.map_err(|e| e.at(dest))
}

/// A download failure, before it is tied to a path on disk
enum DownloadError {
    Source(InstallError),
    Write(std::io::Error),
}

impl DownloadError {
    /// Write errors are reported against `path`, which for a cache fetch is
    /// the cache entry rather than the temp name.
    fn at(self, path: &Path) -> InstallError {
        match self {
            DownloadError::Source(e) => e,
            DownloadError::Write(e) => InstallError::fs(path, e),
        }
    }
}

fn download(
    url: &str,
    file: &mut File,
    label: &str,
    timeout: Duration,
) -> Result<String, DownloadError> {
    let pb = output::spinner(&format!("downloading {}", label));

    let result = open_source(url, timeout)
        .map_err(DownloadError::Source)
        .and_then(|(reader, len)| {
            if let Some(len) = len {
                output::upgrade_to_bytes(&pb, len);
            }
            stream_to_file(url, reader, file, |n| pb.inc(n))
        });

    output::progress_done(pb);
    let (digest, total_bytes) = result?;
    output::detail(&format!("downloaded {} ({} bytes)", label, total_bytes));
    Ok(digest)
}

type Source = (Box<dyn Read + Send + Sync>, Option<u64>);

fn open_source(url: &str, timeout: Duration) -> Result<Source, InstallError> {
    if let Some(path) = url.strip_prefix("file://") {
        let file = File::open(path).map_err(|e| InstallError::network(url, e))?;
        let len = file.metadata().ok().map(|m| m.len());
        return Ok((Box::new(file), len));
    }

    let response = ureq::get(url)
        .timeout(timeout)
        .set("User-Agent", USER_AGENT)
        .call()
        .map_err(|e| match e {
            ureq::Error::Status(code, _) => InstallError::network(url, format!("HTTP {}", code)),
            ureq::Error::Transport(t) => InstallError::network(url, t),
        })?;

    let len = response.header("content-length").and_then(|s| s.parse().ok());
    Ok((response.into_reader(), len))
}

fn stream_to_file(
    url: &str,
    mut reader: impl Read,
    file: &mut File,
    mut on_progress: impl FnMut(u64),
) -> Result<(String, u64), DownloadError> {
    let mut hasher = sha2::Sha256::new();
    let mut buffer = [0u8; 8192];
    let mut total_bytes = 0u64;

    loop {
        let n = reader.read(&mut buffer).map_err(|e| {
            DownloadError::Source(InstallError::network(url, format!("read error: {}", e)))
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        file.write_all(&buffer[..n]).map_err(DownloadError::Write)?;
        total_bytes += n as u64;
        on_progress(n as u64);
    }

    file.sync_all().map_err(DownloadError::Write)?;
    Ok((hex::encode(hasher.finalize()), total_bytes))
}
