//! Transactional placement of files into the prefix
//!
//! Each file is copied to a temporary file in its destination directory and
//! renamed over the destination, so a reader never sees a half-written
//! binary. Whatever was at the destination before is moved aside first.
//! Until [`Transaction::commit`] is called, dropping the transaction puts
//! every backup back, removes every newly placed file and removes the
//! directories it had to create, if they are empty again.

use crate::core::error::InstallError;
use crate::core::output;
use std::fs::File;
use std::path::{Path, PathBuf};

#[derive(Debug)]
struct Placed {
    dest: PathBuf,
    backup: Option<PathBuf>,
}

/// A set of file placements that either all stay or all go
#[derive(Debug, Default)]
pub struct Transaction {
    placed: Vec<Placed>,
    /// Directories created by `place`, outermost first
    created_dirs: Vec<PathBuf>,
    finished: bool,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy `src` to `dest` and set its permission bits.
    ///
    /// The destination's parent directory is created if missing.
    pub fn place(&mut self, src: &Path, dest: &Path, mode: u32) -> Result<(), InstallError> {
        let dir = dest
            .parent()
            .ok_or_else(|| InstallError::fs(dest, "destination has no parent directory"))?;
        let missing: Vec<PathBuf> = dir
            .ancestors()
            .take_while(|d| !d.as_os_str().is_empty() && !d.exists())
            .map(Path::to_path_buf)
            .collect();
        std::fs::create_dir_all(dir).map_err(|e| InstallError::fs(dir, e))?;
        self.created_dirs.extend(missing.into_iter().rev());

        let mut tmp = tempfile::Builder::new()
            .prefix(".formula-")
            .tempfile_in(dir)
            .map_err(|e| InstallError::fs(dir, e))?;
        let mut source = File::open(src).map_err(|e| InstallError::fs(src, e))?;
        std::io::copy(&mut source, tmp.as_file_mut()).map_err(|e| InstallError::fs(dest, e))?;
        set_mode(tmp.path(), mode)?;
        tmp.as_file().sync_all().map_err(|e| InstallError::fs(dest, e))?;

        let backup = if dest.symlink_metadata().is_ok() {
            let backup = backup_path(dest, self.placed.len());
            std::fs::rename(dest, &backup).map_err(|e| InstallError::fs(dest, e))?;
            Some(backup)
        } else {
            None
        };

        // Recorded before the rename so a failed rename still restores the backup
        self.placed.push(Placed {
            dest: dest.to_path_buf(),
            backup,
        });
        tmp.persist(dest).map_err(|e| InstallError::fs(dest, e.error))?;

        output::detail(&format!("install {} -> {}", src.display(), dest.display()));
        Ok(())
    }

    /// Files placed so far, in order
    pub fn placed(&self) -> Vec<PathBuf> {
        self.placed.iter().map(|p| p.dest.clone()).collect()
    }

    /// Keep every placed file and discard backups
    pub fn commit(mut self) -> Vec<PathBuf> {
        self.finished = true;
        self.created_dirs.clear();
        let placed = std::mem::take(&mut self.placed);
        for p in &placed {
            if let Some(backup) = &p.backup {
                let _ = std::fs::remove_file(backup);
            }
        }
        placed.into_iter().map(|p| p.dest).collect()
    }

    /// Undo every placement now
    pub fn rollback(mut self) {
        self.undo();
    }

    fn undo(&mut self) {
        self.finished = true;
        for p in self.placed.drain(..).rev() {
            let _ = std::fs::remove_file(&p.dest);
            if let Some(backup) = p.backup
                && let Err(e) = std::fs::rename(&backup, &p.dest)
            {
                output::warning(&format!(
                    "could not restore {} from {}: {}",
                    p.dest.display(),
                    backup.display(),
                    e
                ));
            }
        }
        // remove_dir refuses non-empty directories, which is what we want
        for dir in self.created_dirs.drain(..).rev() {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            self.undo();
        }
    }
}

fn backup_path(dest: &Path, index: usize) -> PathBuf {
    let name = dest
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.formula-backup.{}", name, index))
}

/// Set file permissions (Unix only).
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| InstallError::fs(path, format!("chmod failed: {}", e)))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> Result<(), InstallError> {
    Ok(())
}
