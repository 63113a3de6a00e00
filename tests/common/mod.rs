//! Shared fixtures for pipeline and CLI tests

#![allow(dead_code)]

use levitate_formula::{Formula, Installer, Settings, load_formula_str};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Checksum pinned by the shipped aetherlang formula
pub const AETH_SHA256: &str = "0019dfc4b32d63c1392aa264aed2253c1e0c2fb09216f8e2cc269bbfb8bb49b5";

/// A throwaway prefix, cache, formulas directory and release mirror
pub struct Sandbox {
    pub dir: TempDir,
    pub prefix: PathBuf,
    pub cache: PathBuf,
    pub formulas: PathBuf,
    pub releases: PathBuf,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let prefix = dir.path().join("prefix");
        let cache = dir.path().join("cache");
        let formulas = dir.path().join("formulas");
        let releases = dir.path().join("releases");
        for d in [&prefix, &formulas, &releases] {
            std::fs::create_dir_all(d).unwrap();
        }
        Self {
            dir,
            prefix,
            cache,
            formulas,
            releases,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings::new(&self.prefix, &self.cache).with_timeout_secs(5)
    }

    pub fn installer(&self) -> Installer {
        Installer::new(self.settings())
    }

    /// Publish `body` as `releases/v<version>/aeth` and return its `file://` URL
    pub fn publish(&self, version: &str, body: &[u8]) -> String {
        let dir = self.releases.join(format!("v{}", version));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("aeth");
        std::fs::write(&path, body).unwrap();
        format!("file://{}", path.display())
    }

    /// Publish a gzipped tarball of `files` as `releases/v<version>/<name>`
    /// and return its `file://` URL
    pub fn publish_tar_gz(&self, version: &str, name: &str, files: &[(&str, &[u8])]) -> String {
        let dir = self.releases.join(format!("v{}", version));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);

        let file = std::fs::File::create(&path).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        for (entry, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, entry, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
        format!("file://{}", path.display())
    }

    /// Write `<formulas>/aetherlang.rhai`
    pub fn write_formula(&self, script: &str) -> PathBuf {
        let path = self.formulas.join("aetherlang.rhai");
        std::fs::write(&path, script).unwrap();
        path
    }

    /// Every file and directory under the prefix, relative to it
    pub fn prefix_entries(&self) -> Vec<PathBuf> {
        let mut entries: Vec<PathBuf> = walkdir::WalkDir::new(&self.prefix)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap().path().strip_prefix(&self.prefix).unwrap().to_path_buf())
            .collect();
        entries.sort();
        entries
    }

    pub fn bin(&self, name: &str) -> PathBuf {
        self.prefix.join("bin").join(name)
    }
}

/// A shell script standing in for the real `aeth` binary
pub fn fake_aeth(version_line: &str, exit_code: i32) -> Vec<u8> {
    format!(
        "#!/bin/sh\nif [ \"$1\" = \"--version\" ]; then echo '{}'; fi\nexit {}\n",
        version_line, exit_code
    )
    .into_bytes()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Formula script in the shipped layout, pointed at `url`
pub fn aeth_script(version: &str, url: &str, sha256: &str) -> String {
    format!(
        r#"
let name = "aetherlang";
let desc = "A cloud-native programming language";
let homepage = "https://github.com/iamvirul/Aetherlang";
let version = "{version}";
let license = "MIT";
let url = "{url}";
let sha256 = "{sha256}";
let install = ["aeth"];
let test = ["aeth", "--version"];
"#
    )
}

pub fn aeth_formula(version: &str, url: &str, sha256: &str) -> Formula {
    load_formula_str(&aeth_script(version, url, sha256), "aetherlang").unwrap()
}

pub fn shipped_formulas_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("formulas")
}
