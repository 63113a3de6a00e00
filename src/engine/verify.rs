//! Checksum verification
//!
//! SHA-256 is the only digest a formula pins. SHA-512 and BLAKE3 are computed
//! by `formula hash` for authors who want them for other tooling.

use crate::core::error::InstallError;
use crate::core::output;
use crate::formula::Formula;
use sha2::Digest;
use std::io::Read;
use std::path::Path;

/// Chunk size for reading files during hashing (1MB)
const CHUNK_SIZE: usize = 1024 * 1024;

/// Threshold for showing progress (100MB)
const PROGRESS_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Compare a computed digest against the formula's pinned checksum.
pub fn check_digest(formula: &Formula, actual: &str) -> Result<(), InstallError> {
    if formula.sha256.matches(actual) {
        return Ok(());
    }
    Err(InstallError::Integrity {
        url: formula.url.clone(),
        expected: formula.sha256.to_string(),
        actual: actual.to_ascii_lowercase(),
    })
}

/// Refuse formulas whose checksum was never filled in.
pub fn check_not_placeholder(formula: &Formula) -> Result<(), InstallError> {
    if formula.sha256.is_placeholder() {
        return Err(InstallError::UnverifiedChecksum {
            name: formula.name.clone(),
            digest: formula.sha256.to_string(),
        });
    }
    Ok(())
}

/// SHA-256 of a file as lowercase hex.
///
/// Shows progress for files larger than 100MB.
pub fn sha256_file(file: &Path) -> std::io::Result<String> {
    let mut f = std::fs::File::open(file)?;
    let file_size = f.metadata().map(|m| m.len()).unwrap_or(0);

    let pb = (file_size > PROGRESS_THRESHOLD).then(|| {
        let pb = output::download_progress(file_size);
        pb.set_message("checksum");
        pb
    });

    let mut hasher = sha2::Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = f.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        if let Some(pb) = &pb {
            pb.inc(n as u64);
        }
    }

    if let Some(pb) = pb {
        output::progress_done(pb);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compute all supported hashes for a file at once (for `formula hash`).
pub fn compute_all_hashes(file: &Path) -> std::io::Result<FileHashes> {
    let mut f = std::fs::File::open(file)?;
    let mut sha256_hasher = sha2::Sha256::new();
    let mut sha512_hasher = sha2::Sha512::new();
    let mut blake3_hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let n = f.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        sha256_hasher.update(&buffer[..n]);
        sha512_hasher.update(&buffer[..n]);
        blake3_hasher.update(&buffer[..n]);
    }

    Ok(FileHashes {
        sha256: hex::encode(sha256_hasher.finalize()),
        sha512: hex::encode(sha512_hasher.finalize()),
        blake3: blake3_hasher.finalize().to_hex().to_string(),
    })
}

/// Container for computed file hashes
#[derive(Debug, Clone)]
pub struct FileHashes {
    pub sha256: String,
    pub sha512: String,
    pub blake3: String,
}
