//! Formula CLI - checksum-verified installs of prebuilt binaries
//!
//! Usage:
//!   formula install <name> [--force]   Fetch, verify, install and smoke-test
//!   formula fetch <name>               Download and verify only
//!   formula test <name>                Re-run the smoke test of an installed formula
//!   formula audit [name...]            Static checks (all formulas if none given)
//!   formula info <name> [--json]       Show formula metadata and install status
//!   formula list                       List formulas and installed versions
//!   formula remove <name>              Remove an installed formula
//!   formula hash <path|url>            Print digests for writing a formula

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use levitate_formula::core::config::{
    DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_PREFIX, default_cache_dir, default_formulas_path,
};
use levitate_formula::engine::fetch::download_to;
use levitate_formula::engine::receipt::{self, Receipt};
use levitate_formula::engine::verify::compute_all_hashes;
use levitate_formula::formula::validate_package_name;
use levitate_formula::{
    Formula, InstallOutcome, Installer, Settings, Severity, audit, has_errors, load_formula,
    output,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "formula")]
#[command(about = "Checksum-verified installer for prebuilt release binaries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to formulas directory
    #[arg(short = 'f', long, global = true, env = "FORMULA_PATH")]
    formulas_path: Option<PathBuf>,

    /// Installation prefix
    #[arg(short, long, global = true, env = "FORMULA_PREFIX", default_value = DEFAULT_PREFIX)]
    prefix: PathBuf,

    /// Download cache directory
    #[arg(short, long, global = true, env = "FORMULA_CACHE")]
    cache_dir: Option<PathBuf>,

    /// HTTP timeout in seconds (clamped to 5-300)
    #[arg(
        short,
        long,
        global = true,
        env = "FORMULA_HTTP_TIMEOUT",
        default_value_t = DEFAULT_HTTP_TIMEOUT_SECS
    )]
    timeout: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, verify, install and smoke-test a formula
    Install {
        /// Formula name or path to formula file
        formula: String,

        /// Reinstall even if the same version is already installed
        #[arg(long)]
        force: bool,
    },

    /// Download and verify a formula's artifact without installing it
    Fetch {
        /// Formula name or path to formula file
        formula: String,
    },

    /// Run the smoke test of an installed formula
    Test {
        /// Formula name or path to formula file
        formula: String,
    },

    /// Check formulas for common mistakes
    Audit {
        /// Formula names or paths (all formulas if none given)
        formulas: Vec<String>,
    },

    /// Show formula information
    Info {
        /// Formula name or path to formula file
        formula: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List formulas and their install status
    List,

    /// Remove an installed formula
    Remove {
        /// Formula name
        name: String,
    },

    /// Print SHA-256, SHA-512 and BLAKE3 of a file or URL
    Hash {
        /// Local path, or http(s):// / file:// URL
        source: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let formulas_path = cli.formulas_path.unwrap_or_else(default_formulas_path);
    let settings = Settings::new(cli.prefix, cli.cache_dir.unwrap_or_else(default_cache_dir))
        .with_timeout_secs(cli.timeout);
    let installer = Installer::new(settings);

    match cli.command {
        Commands::Install { formula, force } => {
            let formula = load(&formula, &formulas_path)?;
            let outcome = installer.install(&formula, force).map_err(|e| {
                let step = e.step();
                anyhow::Error::new(e).context(format!(
                    "installing {} failed at the {} step",
                    formula.label(),
                    step
                ))
            })?;
            if let InstallOutcome::Installed { files, .. } = outcome {
                for file in files {
                    output::detail(&file.display().to_string());
                }
            }
        }

        Commands::Fetch { formula } => {
            let formula = load(&formula, &formulas_path)?;
            let fetched = installer.fetch(&formula)?;
            println!("{}", fetched.path.display());
        }

        Commands::Test { formula } => {
            let formula = load(&formula, &formulas_path)?;
            installer.test(&formula)?;
        }

        Commands::Audit { formulas } => {
            let paths = if formulas.is_empty() {
                find_formulas(&formulas_path)?
            } else {
                formulas
                    .iter()
                    .map(|f| resolve_formula(f, &formulas_path))
                    .collect::<Result<Vec<_>>>()?
            };
            audit_formulas(&paths)?;
        }

        Commands::Info { formula, json } => {
            let formula = load(&formula, &formulas_path)?;
            let installed = installer.receipt(&formula.name)?;
            show_info(&formula, installed, json)?;
        }

        Commands::List => {
            list_formulas(&formulas_path, installer.settings())?;
        }

        Commands::Remove { name } => {
            validate_package_name(&name)?;
            installer.remove(&name)?;
        }

        Commands::Hash { source } => {
            hash_source(&source, installer.settings())?;
        }
    }

    Ok(())
}

fn load(formula: &str, formulas_path: &Path) -> Result<Formula> {
    let path = resolve_formula(formula, formulas_path)?;
    load_formula(&path).with_context(|| format!("Failed to load formula: {}", path.display()))
}

/// Resolve a formula name to a formula path
fn resolve_formula(formula: &str, formulas_path: &Path) -> Result<PathBuf> {
    let is_explicit_path =
        formula.contains('/') || formula.contains('\\') || formula.ends_with(".rhai");

    if is_explicit_path {
        let as_path = PathBuf::from(formula);
        if as_path.exists() {
            return Ok(as_path);
        }
        anyhow::bail!("Formula file not found: {}", formula);
    }

    // For formula names, validate to prevent path traversal
    validate_package_name(formula)?;

    let direct = formulas_path.join(format!("{}.rhai", formula));
    if direct.exists() {
        return Ok(direct);
    }

    // <name>/<name>.rhai (subdirectory style)
    let subdir = formulas_path.join(formula).join(format!("{}.rhai", formula));
    if subdir.exists() {
        return Ok(subdir);
    }

    anyhow::bail!(
        "Formula not found: {}\nSearched in: {}",
        formula,
        formulas_path.display()
    )
}

/// All formula files in the formulas directory, sorted
fn find_formulas(formulas_path: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    if !formulas_path.exists() {
        return Ok(found);
    }

    for entry in std::fs::read_dir(formulas_path)
        .with_context(|| format!("Failed to read formulas directory: {}", formulas_path.display()))?
    {
        let path = entry?.path();

        if path.extension().is_some_and(|e| e == "rhai") {
            found.push(path);
        } else if path.is_dir()
            && let Some(dir_name) = path.file_name()
        {
            let nested = path.join(format!("{}.rhai", dir_name.to_string_lossy()));
            if nested.is_file() {
                found.push(nested);
            }
        }
    }

    found.sort();
    Ok(found)
}

fn audit_formulas(paths: &[PathBuf]) -> Result<()> {
    if paths.is_empty() {
        output::info("No formulas to audit");
        return Ok(());
    }

    let mut failed = 0;
    for path in paths {
        let formula = match load_formula(path) {
            Ok(f) => f,
            Err(e) => {
                output::error(&format!("{}: {}", path.display(), e));
                failed += 1;
                continue;
            }
        };

        let findings = audit(&formula);
        if findings.is_empty() {
            output::success(&format!("{}: ok", formula.label()));
            continue;
        }

        output::action(&formula.label());
        for finding in &findings {
            let line = format!("{}: {}", finding.field, finding.message);
            match finding.severity {
                Severity::Error => output::error(&line),
                Severity::Warning => output::warning(&line),
            }
        }
        if has_errors(&findings) {
            failed += 1;
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} formulas failed audit", failed, paths.len());
    }
    Ok(())
}

#[derive(Serialize)]
struct InfoJson<'a> {
    formula: &'a Formula,
    installed: Option<Receipt>,
}

fn show_info(formula: &Formula, installed: Option<Receipt>, json: bool) -> Result<()> {
    if json {
        let doc = InfoJson { formula, installed };
        println!(
            "{}",
            serde_json::to_string_pretty(&doc).context("Failed to serialize formula info")?
        );
        return Ok(());
    }

    output::field("Name", &formula.name);
    output::field("Version", &formula.version);
    if let Some(desc) = &formula.desc {
        output::field("Description", desc);
    }
    if let Some(homepage) = &formula.homepage {
        output::field("Homepage", homepage);
    }
    if let Some(license) = &formula.license {
        output::field("License", license);
    }
    output::field("URL", &formula.url);
    output::field("SHA-256", formula.sha256.as_str());
    for target in &formula.install {
        output::field(
            "Installs",
            &format!(
                "{} -> {} ({:o})",
                target.file,
                target.relative_dest().display(),
                target.effective_mode()
            ),
        );
    }
    if let Some(test) = &formula.test {
        output::field("Test", &test.to_string());
    }
    if let Some(source) = &formula.source {
        output::field("Formula", &source.display().to_string());
    }
    println!();

    match installed {
        Some(receipt) => {
            output::field("Status", &format!("installed {}", receipt.version));
            for file in &receipt.installed_files {
                output::field("File", &file.display().to_string());
            }
        }
        None => output::field("Status", "not installed"),
    }

    Ok(())
}

fn list_formulas(formulas_path: &Path, settings: &Settings) -> Result<()> {
    let mut receipts = receipt::list(settings)?;
    let mut found = false;

    for path in find_formulas(formulas_path)? {
        let formula = match load_formula(&path) {
            Ok(f) => f,
            Err(e) => {
                output::warning(&format!("skipping {}: {}", path.display(), e));
                continue;
            }
        };

        let installed = receipts
            .iter()
            .position(|r| r.name == formula.name)
            .map(|i| receipts.remove(i));
        let status = match &installed {
            Some(r) if r.version != formula.version => format!(
                "[installed: {}, {} available]",
                r.version, formula.version
            ),
            Some(r) => format!("[installed: {}]", r.version),
            None => format!("[available: {}]", formula.version),
        };
        output::list_item(&formula.name, &status, installed.is_some());
        found = true;
    }

    // Installed without a formula on disk
    for r in receipts {
        output::list_item(&r.name, &format!("[installed: {}, no formula]", r.version), true);
        found = true;
    }

    if !found {
        output::info(&format!("No formulas found in {}", formulas_path.display()));
    }
    Ok(())
}

fn hash_source(source: &str, settings: &Settings) -> Result<()> {
    let is_url = ["http://", "https://", "file://"]
        .iter()
        .any(|scheme| source.starts_with(scheme));

    // Keeps a downloaded file alive until hashing is done
    let tmp_dir;
    let path = if is_url {
        tmp_dir = tempfile::tempdir().context("Failed to create temporary directory")?;
        let dest = tmp_dir.path().join("download");
        download_to(source, &dest, settings.http_timeout)?;
        dest
    } else {
        PathBuf::from(source)
    };

    let hashes = compute_all_hashes(&path)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    output::field("sha256", &hashes.sha256);
    output::field("sha512", &hashes.sha512);
    output::field("blake3", &hashes.blake3);
    Ok(())
}
