//! Checksum-verified formula installer for LevitateOS
//!
//! A formula is a small Rhai script that pins one release of a package: the
//! download URL, the SHA-256 the download must hash to, where its files go,
//! and a command that proves the installed binary runs.
//!
//! # Example Formula
//!
//! ```rhai
//! let name = "aetherlang";
//! let desc = "Aetherlang programming language";
//! let version = "1.1.0";
//! let url = `https://github.com/iamvirul/Aetherlang/releases/download/v${version}/aeth`;
//! let sha256 = "0019dfc4b32d63c1392aa264aed2253c1e0c2fb09216f8e2cc269bbfb8bb49b5";
//! let install = ["aeth"];
//! let test = ["aeth", "--version"];
//! ```
//!
//! # Pipeline
//!
//! `fetch -> verify -> install -> test`. Each step either succeeds or
//! aborts the whole install:
//! - a download or checksum failure happens before anything is written to
//!   the prefix
//! - a placement or smoke test failure rolls every placed file back
//!
//! # Install Targets
//!
//! `install` entries are either a file name (installed into `bin/`) or a map:
//!
//! ```rhai
//! let install = [
//!     "aeth",
//!     #{ file: "aeth.conf", to: "etc", rename: "aetherlang.conf" },
//!     #{ file: "aeth-helper", to: "libexec", mode: 0o750 },
//! ];
//! ```
//!
//! Valid `to` kinds: `bin`, `sbin`, `libexec`, `lib`, `share`, `etc`.
//!
//! # Usage
//!
//! ```no_run
//! use levitate_formula::{Installer, Settings, load_formula};
//! use std::path::Path;
//!
//! let formula = load_formula(Path::new("formulas/aetherlang.rhai"))?;
//! let installer = Installer::new(Settings::new("/usr/local", "/var/cache/formula"));
//! installer.install(&formula, false)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod core;
pub mod engine;
pub mod formula;

pub use core::config::Settings;
pub use core::error::{FormulaError, InstallError};
pub use core::output;
pub use engine::{InstallOutcome, Installer};
pub use formula::{
    DestinationKind, Finding, Formula, InstallTarget, Severity, Sha256Digest, VerifyCommand,
    audit, has_errors, load_formula, load_formula_str,
};
