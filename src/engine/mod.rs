//! Install pipeline
//!
//! The flow for one formula:
//! 1. fetch   - download the artifact into the cache (or reuse a cached copy)
//! 2. verify  - compare its SHA-256 with the formula's checksum
//! 3. install - place each target into the prefix inside a [`stage::Transaction`]
//! 4. test    - run the formula's smoke test against the placed files
//!
//! Any failure in 3 or 4 rolls the prefix back. Failures in 1 or 2 happen
//! before the prefix is touched.

pub mod extract;
pub mod fetch;
pub mod receipt;
pub mod smoke;
pub mod stage;
pub mod verify;

use crate::core::config::Settings;
use crate::core::error::InstallError;
use crate::core::lock::{FormulaLock, acquire_formula_lock};
use crate::core::output;
use crate::formula::audit::url_embeds_version;
use crate::formula::{Formula, InstallTarget};
use anyhow::{Context, Result};
use receipt::Receipt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub use fetch::Fetched;

type Sources<'a> = Vec<(&'a InstallTarget, PathBuf)>;

/// What [`Installer::install`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Files were placed and the smoke test passed
    Installed {
        files: Vec<PathBuf>,
        /// First line printed by the smoke test, if the formula has one
        test_output: Option<String>,
    },
    /// A matching, intact install was already present
    AlreadyInstalled,
}

/// Runs formulas against one prefix and cache
#[derive(Debug, Clone)]
pub struct Installer {
    settings: Settings,
}

impl Installer {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn prefix(&self) -> &Path {
        &self.settings.prefix
    }

    /// Fetch, verify, install and smoke-test a formula.
    ///
    /// Skips the work when a receipt for the same version and checksum exists
    /// and all its files are present, unless `force` is set.
    pub fn install(&self, formula: &Formula, force: bool) -> Result<InstallOutcome, InstallError> {
        let prefix = self.prefix();
        if !prefix.is_dir() {
            return Err(InstallError::fs(prefix, "installation prefix does not exist"));
        }
        if !url_embeds_version(&formula.url, &formula.version) {
            output::warning(&format!(
                "url of {} does not contain version {}",
                formula.name, formula.version
            ));
        }

        let _lock = self.lock(&formula.name)?;

        let previous = match Receipt::load(&self.settings, &formula.name) {
            Ok(previous) => previous,
            Err(e) => {
                output::warning(&format!("ignoring unreadable receipt: {:#}", e));
                None
            }
        };
        if !force
            && let Some(previous) = &previous
            && previous.matches(formula)
            && previous.is_intact()
        {
            output::skip(&format!("{} already installed, skipping", formula.label()));
            return Ok(InstallOutcome::AlreadyInstalled);
        }

        output::action(&format!("Installing {}", formula.label()));

        output::step("fetch");
        let fetched = fetch::fetch(formula, &self.settings)?;

        output::step("install");
        // Removed on drop, after the install commits or rolls back
        let (_unpacked, sources) = self.resolve_sources(formula, &fetched)?;
        let mut tx = stage::Transaction::new();
        for (target, src) in &sources {
            let dest = prefix.join(target.relative_dest());
            tx.place(src, &dest, target.effective_mode())?;
        }

        let test_output = match &formula.test {
            Some(cmd) => {
                output::step("test");
                let program = smoke::resolve_program(cmd, &tx.placed(), prefix);
                match smoke::run(cmd, &program) {
                    Ok(line) => {
                        output::detail(&format!("{}: {}", cmd, line));
                        Some(line)
                    }
                    Err(e) => {
                        output::warning("smoke test failed, rolling back");
                        tx.rollback();
                        return Err(e);
                    }
                }
            }
            None => {
                output::skip("no test command");
                None
            }
        };

        // The transaction is still armed here, so a failed write rolls back
        Receipt::new(formula, tx.placed()).write(&self.settings)?;
        let files = tx.commit();

        if let Some(previous) = previous {
            remove_stale_files(&previous.installed_files, &files);
        }

        output::success(&format!(
            "{} installed ({} files)",
            formula.label(),
            files.len()
        ));
        Ok(InstallOutcome::Installed { files, test_output })
    }

    /// Fetch and verify only. Nothing outside the cache is written.
    pub fn fetch(&self, formula: &Formula) -> Result<Fetched, InstallError> {
        let _lock = self.lock(&formula.name)?;
        output::action(&format!("Fetching {}", formula.label()));
        let fetched = fetch::fetch(formula, &self.settings)?;
        output::success(&format!("{} verified", fetched.path.display()));
        Ok(fetched)
    }

    /// Run the smoke test of an installed formula.
    ///
    /// Returns `None` when the formula has no test command.
    pub fn test(&self, formula: &Formula) -> Result<Option<String>> {
        let receipt = Receipt::load(&self.settings, &formula.name)?
            .with_context(|| format!("{} is not installed", formula.name))?;

        let Some(cmd) = &formula.test else {
            output::skip(&format!("{} has no test command", formula.name));
            return Ok(None);
        };

        output::action(&format!("Testing {}", formula.label()));
        let program = smoke::resolve_program(cmd, &receipt.installed_files, self.prefix());
        let line = smoke::run(cmd, &program)?;
        output::success(&format!("{}: {}", cmd, line));
        Ok(Some(line))
    }

    /// Delete the files recorded in a formula's receipt, then the receipt.
    ///
    /// Returns how many files were deleted. Files that are already gone are
    /// skipped.
    pub fn remove(&self, name: &str) -> Result<usize> {
        let _lock = self.lock(name)?;
        let receipt = Receipt::load(&self.settings, name)?
            .with_context(|| format!("{} is not installed", name))?;

        output::action(&format!("Removing {} {}", receipt.name, receipt.version));

        let mut deleted = 0;
        let mut failed = 0;
        for path in &receipt.installed_files {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    output::detail(&format!("rm {}", path.display()));
                    deleted += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    output::detail(&format!("{} already gone", path.display()));
                }
                Err(e) => {
                    output::warning(&format!("failed to remove {}: {}", path.display(), e));
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            anyhow::bail!(
                "Failed to remove {} of {} files for {}. Receipt kept. \
                 Fix permissions or run with sudo, then try again.",
                failed,
                receipt.installed_files.len(),
                name
            );
        }

        Receipt::remove(&self.settings, name)?;
        output::success(&format!("{} removed ({} files)", name, deleted));
        Ok(deleted)
    }

    /// Receipt for `name`, if installed
    pub fn receipt(&self, name: &str) -> Result<Option<Receipt>> {
        Receipt::load(&self.settings, name)
    }

    fn lock(&self, name: &str) -> Result<FormulaLock, InstallError> {
        let dir = self.settings.locks_dir();
        acquire_formula_lock(&dir, name).map_err(|e| InstallError::fs(dir, format!("{:#}", e)))
    }

    /// Pair each install target with the file it is copied from.
    ///
    /// A bare artifact is the source of every target. An archive is unpacked
    /// into a temp directory under the cache, returned alongside the sources,
    /// and each target's `file` is looked up inside it.
    fn resolve_sources<'a>(
        &self,
        formula: &'a Formula,
        fetched: &Fetched,
    ) -> Result<(Option<TempDir>, Sources<'a>), InstallError> {
        let Some(format) = extract::detect_format(formula.artifact_name()) else {
            let sources = formula
                .install
                .iter()
                .map(|t| (t, fetched.path.clone()))
                .collect();
            return Ok((None, sources));
        };

        let unpack_root = self.settings.unpack_dir();
        std::fs::create_dir_all(&unpack_root).map_err(|e| InstallError::fs(&unpack_root, e))?;
        let unpack = tempfile::Builder::new()
            .prefix(&format!("{}--{}-", formula.name, formula.version))
            .tempdir_in(&unpack_root)
            .map_err(|e| InstallError::fs(&unpack_root, e))?;
        extract::extract(&fetched.path, format, unpack.path())?;

        let sources: Sources<'a> = formula
            .install
            .iter()
            .map(|t| find_in_tree(unpack.path(), &t.file).map(|src| (t, src)))
            .collect::<Result<_, _>>()?;
        Ok((Some(unpack), sources))
    }
}

/// Locate `file` inside an unpacked archive.
///
/// Tried in order: the exact relative path, a glob pattern, then any file
/// with that name at any depth (archives often wrap everything in a
/// `name-version/` directory).
fn find_in_tree(root: &Path, file: &str) -> Result<PathBuf, InstallError> {
    let direct = root.join(file);
    if direct.is_file() {
        return Ok(direct);
    }

    if file.contains(['*', '?', '[']) {
        let pattern = root.join(file);
        let mut matches: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| InstallError::fs(root, format!("invalid pattern '{}': {}", file, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect();
        matches.sort();
        return match matches.len() {
            0 => Err(not_in_archive(root, file)),
            1 => Ok(matches.remove(0)),
            n => Err(InstallError::fs(
                root,
                format!("pattern '{}' matches {} files", file, n),
            )),
        };
    }

    let mut found: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.path().ends_with(file))
        .map(|e| e.into_path())
        .collect();
    found.sort_by_key(|p| p.components().count());
    found
        .into_iter()
        .next()
        .ok_or_else(|| not_in_archive(root, file))
}

fn not_in_archive(root: &Path, file: &str) -> InstallError {
    InstallError::fs(root, format!("'{}' not found in archive", file))
}

/// After an upgrade, delete files the old install had that the new one doesn't.
fn remove_stale_files(previous: &[PathBuf], current: &[PathBuf]) {
    for path in previous.iter().filter(|p| !current.contains(p)) {
        match std::fs::remove_file(path) {
            Ok(()) => output::detail(&format!("rm stale {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => output::warning(&format!("failed to remove {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::load_formula_str;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        installer: Installer,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let prefix = dir.path().join("prefix");
            std::fs::create_dir_all(&prefix).unwrap();
            let installer = Installer::new(Settings::new(prefix, dir.path().join("cache")));
            Self { dir, installer }
        }

        fn prefix(&self) -> &Path {
            self.installer.prefix()
        }

        /// Write an artifact under `release/v<version>/` and return its formula
        fn formula(&self, version: &str, artifact: &[u8], extra: &str) -> Formula {
            let release = self.dir.path().join(format!("release/v{}", version));
            std::fs::create_dir_all(&release).unwrap();
            let artifact_path = release.join("aeth");
            std::fs::write(&artifact_path, artifact).unwrap();
            let sha = verify::sha256_file(&artifact_path).unwrap();

            let script = format!(
                r#"
                let name = "aetherlang";
                let version = "{version}";
                let url = "file://{url}";
                let sha256 = "{sha}";
                let install = ["aeth"];
                {extra}
                "#,
                url = artifact_path.display()
            );
            load_formula_str(&script, "aetherlang").unwrap()
        }
    }

    fn script(body: &str) -> Vec<u8> {
        format!("#!/bin/sh\n{}\n", body).into_bytes()
    }

    #[cfg(unix)]
    #[test]
    fn test_install_places_binary_and_receipt() {
        let fx = Fixture::new();
        let f = fx.formula(
            "1.1.0",
            &script("echo aeth 1.1.0"),
            r#"let test = ["aeth", "--version"];"#,
        );

        let outcome = fx.installer.install(&f, false).unwrap();
        let bin = fx.prefix().join("bin/aeth");
        assert_eq!(
            outcome,
            InstallOutcome::Installed {
                files: vec![bin.clone()],
                test_output: Some("aeth 1.1.0".into()),
            }
        );
        assert!(bin.is_file());

        let receipt = fx.installer.receipt("aetherlang").unwrap().unwrap();
        assert_eq!(receipt.version, "1.1.0");
        assert_eq!(receipt.installed_files, vec![bin]);
    }

    #[cfg(unix)]
    #[test]
    fn test_install_twice_is_idempotent() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", &script("echo ok"), r#"let test = ["aeth"];"#);

        fx.installer.install(&f, false).unwrap();
        let first = std::fs::read(fx.prefix().join("bin/aeth")).unwrap();
        assert_eq!(
            fx.installer.install(&f, false).unwrap(),
            InstallOutcome::AlreadyInstalled
        );
        assert!(matches!(
            fx.installer.install(&f, true).unwrap(),
            InstallOutcome::Installed { .. }
        ));
        assert_eq!(std::fs::read(fx.prefix().join("bin/aeth")).unwrap(), first);
    }

    #[cfg(unix)]
    #[test]
    fn test_install_repairs_missing_file() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", &script("echo ok"), "");
        fx.installer.install(&f, false).unwrap();

        std::fs::remove_file(fx.prefix().join("bin/aeth")).unwrap();
        assert!(matches!(
            fx.installer.install(&f, false).unwrap(),
            InstallOutcome::Installed { .. }
        ));
        assert!(fx.prefix().join("bin/aeth").is_file());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_smoke_test_rolls_back() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", &script("exit 1"), r#"let test = ["aeth", "--version"];"#);

        let err = fx.installer.install(&f, false).unwrap_err();
        assert!(matches!(err, InstallError::Verification { .. }));
        assert_eq!(std::fs::read_dir(fx.prefix()).unwrap().count(), 0);
        assert!(fx.installer.receipt("aetherlang").unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_failed_upgrade_restores_previous_version() {
        let fx = Fixture::new();
        let good = fx.formula("1.0.0", &script("echo aeth 1.0.0"), r#"let test = ["aeth"];"#);
        fx.installer.install(&good, false).unwrap();
        let before = std::fs::read(fx.prefix().join("bin/aeth")).unwrap();

        let bad = fx.formula("1.1.0", &script("exit 1"), r#"let test = ["aeth"];"#);
        assert!(fx.installer.install(&bad, false).is_err());

        assert_eq!(std::fs::read(fx.prefix().join("bin/aeth")).unwrap(), before);
        let receipt = fx.installer.receipt("aetherlang").unwrap().unwrap();
        assert_eq!(receipt.version, "1.0.0");
    }

    #[test]
    fn test_missing_prefix_is_filesystem_error() {
        let dir = TempDir::new().unwrap();
        let installer = Installer::new(Settings::new(
            dir.path().join("no-such-prefix"),
            dir.path().join("cache"),
        ));
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", b"bin", "");

        let err = installer.install(&f, false).unwrap_err();
        assert!(matches!(err, InstallError::Filesystem { .. }));
        assert!(!dir.path().join("no-such-prefix").exists());
    }

    #[test]
    fn test_checksum_mismatch_writes_nothing_to_prefix() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", b"original", "");
        std::fs::write(fx.dir.path().join("release/v1.1.0/aeth"), b"tampered").unwrap();

        let err = fx.installer.install(&f, false).unwrap_err();
        assert!(matches!(err, InstallError::Integrity { .. }));
        assert_eq!(std::fs::read_dir(fx.prefix()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_remove_deletes_files_and_receipt() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", &script("echo ok"), "");
        fx.installer.install(&f, false).unwrap();

        assert_eq!(fx.installer.remove("aetherlang").unwrap(), 1);
        assert!(!fx.prefix().join("bin/aeth").exists());
        assert!(fx.installer.receipt("aetherlang").unwrap().is_none());
        assert!(fx.installer.remove("aetherlang").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_test_requires_install() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", &script("echo aeth 1.1.0"), r#"let test = ["aeth"];"#);
        assert!(fx.installer.test(&f).is_err());

        fx.installer.install(&f, false).unwrap();
        assert_eq!(fx.installer.test(&f).unwrap(), Some("aeth 1.1.0".into()));
    }

    #[test]
    fn test_fetch_refused_while_formula_locked() {
        let fx = Fixture::new();
        let f = fx.formula("1.1.0", b"release", "");
        let locks = fx.installer.settings().locks_dir();
        let held = acquire_formula_lock(&locks, "aetherlang").unwrap();

        let err = fx.installer.fetch(&f).unwrap_err();
        assert!(matches!(err, InstallError::Filesystem { .. }));
        assert!(err.to_string().contains("already being processed"));
        assert!(!fx.installer.settings().downloads_dir().exists());

        drop(held);
        let fetched = fx.installer.fetch(&f).unwrap();
        assert_eq!(std::fs::read(&fetched.path).unwrap(), b"release");
    }

    fn tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_install_cleans_unpack_dir() {
        let fx = Fixture::new();
        let release = fx.dir.path().join("release/v1.1.0");
        std::fs::create_dir_all(&release).unwrap();
        let archive = release.join("aeth-1.1.0.tar.gz");
        tar_gz(
            &archive,
            &[
                ("aeth-1.1.0/bin/aeth", script("echo aeth 1.1.0").as_slice()),
                ("aeth-1.1.0/README", &b"docs"[..]),
            ],
        );
        let f = load_formula_str(
            &format!(
                r#"
                let name = "aetherlang";
                let version = "1.1.0";
                let url = "file://{}";
                let sha256 = "{}";
                let install = [#{{ file: "bin/aeth" }}];
                let test = ["aeth", "--version"];
                "#,
                archive.display(),
                verify::sha256_file(&archive).unwrap()
            ),
            "aetherlang",
        )
        .unwrap();

        let outcome = fx.installer.install(&f, false).unwrap();
        assert!(matches!(
            outcome,
            InstallOutcome::Installed { test_output: Some(ref line), .. } if line == "aeth 1.1.0"
        ));
        assert!(fx.prefix().join("bin/aeth").is_file());
        assert!(!fx.prefix().join("bin/README").exists());

        let unpack = fx.installer.settings().unpack_dir();
        assert_eq!(std::fs::read_dir(&unpack).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_archive_missing_target_leaves_prefix_empty() {
        let fx = Fixture::new();
        let archive = fx.dir.path().join("aeth-1.1.0.tar.gz");
        tar_gz(&archive, &[("aeth-1.1.0/README", &b"docs"[..])]);
        let f = load_formula_str(
            &format!(
                r#"
                let name = "aetherlang";
                let version = "1.1.0";
                let url = "file://{}";
                let sha256 = "{}";
                let install = ["aeth"];
                "#,
                archive.display(),
                verify::sha256_file(&archive).unwrap()
            ),
            "aetherlang",
        )
        .unwrap();

        let err = fx.installer.install(&f, false).unwrap_err();
        assert!(err.to_string().contains("not found in archive"));
        assert_eq!(std::fs::read_dir(fx.prefix()).unwrap().count(), 0);
        let unpack = fx.installer.settings().unpack_dir();
        assert_eq!(std::fs::read_dir(&unpack).unwrap().count(), 0);
    }

    #[test]
    fn test_find_in_tree() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("aeth-1.1.0/bin")).unwrap();
        std::fs::write(root.join("aeth-1.1.0/bin/aeth"), b"x").unwrap();
        std::fs::write(root.join("aeth-1.1.0/README"), b"x").unwrap();

        assert_eq!(
            find_in_tree(root, "aeth-1.1.0/bin/aeth").unwrap(),
            root.join("aeth-1.1.0/bin/aeth")
        );
        assert_eq!(find_in_tree(root, "*/bin/aeth").unwrap(), root.join("aeth-1.1.0/bin/aeth"));
        assert_eq!(find_in_tree(root, "bin/aeth").unwrap(), root.join("aeth-1.1.0/bin/aeth"));
        assert!(find_in_tree(root, "aethc").is_err());
    }

    #[test]
    fn test_remove_stale_files() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let kept = dir.path().join("kept");
        std::fs::write(&old, b"x").unwrap();
        std::fs::write(&kept, b"x").unwrap();

        remove_stale_files(&[old.clone(), kept.clone()], std::slice::from_ref(&kept));
        assert!(!old.exists());
        assert!(kept.exists());
    }
}
