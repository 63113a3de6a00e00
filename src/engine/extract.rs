//! Archive extraction for formulas whose artifact is not a bare binary
//!
//! Format is detected from the artifact name. Unknown extensions mean the
//! artifact is installed as-is.

use crate::core::error::InstallError;
use crate::core::output;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Tar,
    Zip,
}

/// Detect archive format from filename extension
pub fn detect_format(name: &str) -> Option<ArchiveFormat> {
    let name = name.to_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveFormat::TarGz)
    } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
        Some(ArchiveFormat::TarXz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        Some(ArchiveFormat::TarBz2)
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        Some(ArchiveFormat::TarZst)
    } else if name.ends_with(".tar") {
        Some(ArchiveFormat::Tar)
    } else if name.ends_with(".zip") {
        Some(ArchiveFormat::Zip)
    } else {
        None
    }
}

/// Unpack `archive` into a fresh `dest` directory.
///
/// `dest` is removed first so a previous, possibly different, unpack never
/// leaks files into this one.
pub fn extract(archive: &Path, format: ArchiveFormat, dest: &Path) -> Result<(), InstallError> {
    if dest.exists() {
        std::fs::remove_dir_all(dest).map_err(|e| InstallError::fs(dest, e))?;
    }
    std::fs::create_dir_all(dest).map_err(|e| InstallError::fs(dest, e))?;

    let filename = archive
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "archive".to_string());
    let pb = output::spinner(&format!("extracting {}", filename));

    let result = match format {
        ArchiveFormat::TarGz => open(archive)
            .and_then(|r| extract_tar(flate2::read::GzDecoder::new(r), archive, dest)),
        ArchiveFormat::TarXz => {
            open(archive).and_then(|r| extract_tar(xz2::read::XzDecoder::new(r), archive, dest))
        }
        ArchiveFormat::TarBz2 => open(archive)
            .and_then(|r| extract_tar(bzip2::read::BzDecoder::new(r), archive, dest)),
        ArchiveFormat::TarZst => open(archive).and_then(|r| {
            let decoder = zstd::stream::read::Decoder::new(r)
                .map_err(|e| InstallError::fs(archive, format!("zstd init error: {}", e)))?;
            extract_tar(decoder, archive, dest)
        }),
        ArchiveFormat::Tar => open(archive).and_then(|r| extract_tar(r, archive, dest)),
        ArchiveFormat::Zip => extract_zip(archive, dest),
    };

    output::progress_done(pb);
    result?;
    output::detail(&format!("extracted {} to {}", filename, dest.display()));
    Ok(())
}

fn open(archive: &Path) -> Result<BufReader<File>, InstallError> {
    File::open(archive)
        .map(BufReader::new)
        .map_err(|e| InstallError::fs(archive, e))
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn extract_tar<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let err = |reason: String| InstallError::fs(archive, reason);
    let mut tar = tar::Archive::new(reader);

    for entry in tar.entries().map_err(|e| err(format!("tar read error: {}", e)))? {
        let mut entry = entry.map_err(|e| err(format!("tar entry error: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| err(format!("tar path error: {}", e)))?
            .into_owned();

        if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            return Err(err(format!("tar contains unsafe path: {}", path.display())));
        }

        let entry_type = entry.header().entry_type();
        if entry_type == tar::EntryType::Symlink || entry_type == tar::EntryType::Link {
            let link = entry
                .link_name()
                .map_err(|e| err(format!("tar link error: {}", e)))?
                .ok_or_else(|| err(format!("link without target: {}", path.display())))?
                .into_owned();
            let parent = path.parent().unwrap_or(Path::new(""));
            let resolved = normalize_lexical(&parent.join(&link));
            if link.is_absolute() || resolved.starts_with("..") {
                return Err(err(format!(
                    "tar contains link escaping destination: {} -> {}",
                    path.display(),
                    link.display()
                )));
            }
        }

        entry
            .unpack_in(dest)
            .map_err(|e| err(format!("unpack error for {}: {}", path.display(), e)))?;
    }

    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let err = |reason: String| InstallError::fs(archive_path, reason);
    let file = File::open(archive_path).map_err(|e| InstallError::fs(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| err(format!("zip read error: {}", e)))?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| err(format!("zip entry error: {}", e)))?;

        let Some(relative) = file.enclosed_name() else {
            return Err(err(format!("zip contains unsafe path: {}", file.name())));
        };
        let outpath = dest.join(relative);

        if file.is_dir() {
            std::fs::create_dir_all(&outpath).map_err(|e| InstallError::fs(&outpath, e))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::fs(parent, e))?;
        }
        let mut outfile = File::create(&outpath).map_err(|e| InstallError::fs(&outpath, e))?;
        std::io::copy(&mut file, &mut outfile).map_err(|e| InstallError::fs(&outpath, e))?;

        #[cfg(unix)]
        if let Some(mode) = file.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))
                .map_err(|e| InstallError::fs(&outpath, e))?;
        }
    }

    Ok(())
}
