//! Formula loader
//!
//! Formulas are Rhai scripts made of top-level `let` bindings:
//!
//! ```rhai
//! let name = "aetherlang";
//! let version = "1.1.0";
//! let url = `https://github.com/iamvirul/Aetherlang/releases/download/v${version}/aeth`;
//! let sha256 = "0019dfc4b32d63c1392aa264aed2253c1e0c2fb09216f8e2cc269bbfb8bb49b5";
//! let install = ["aeth"];
//! let test = ["aeth", "--version"];
//! ```
//!
//! The script runs once in a locked-down engine (no imports, bounded
//! operations) with `ARCH` and `OS` in scope, so a formula can pick a
//! per-platform URL. The resulting variables are read back into a [`Formula`].

use super::{DestinationKind, Formula, InstallTarget, Sha256Digest, VerifyCommand};
use crate::core::error::FormulaError;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{Dynamic, Engine, Scope};
use serde::Deserialize;
use std::path::{Component, Path};

/// Upper bound on script operations; a formula is data, not a program
const MAX_OPERATIONS: u64 = 100_000;

/// Load a formula from a file. The file stem is the default `name`.
pub fn load_formula(path: &Path) -> Result<Formula, FormulaError> {
    let script = std::fs::read_to_string(path).map_err(|source| FormulaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut formula = load_formula_str(&script, &stem)?;
    formula.source = Some(path.to_path_buf());
    Ok(formula)
}

/// Load a formula from script text
pub fn load_formula_str(script: &str, default_name: &str) -> Result<Formula, FormulaError> {
    let engine = formula_engine();

    let mut scope = Scope::new();
    scope.push_constant("ARCH", std::env::consts::ARCH.to_string());
    scope.push_constant("OS", std::env::consts::OS.to_string());

    let ast = engine
        .compile(script)
        .map_err(|e| FormulaError::Script(e.to_string()))?;
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| FormulaError::Script(e.to_string()))?;

    let name = optional_string(&scope, "name")?.unwrap_or_else(|| default_name.to_string());
    super::validate_package_name(&name).map_err(|e| FormulaError::InvalidField {
        field: "name",
        reason: e.to_string(),
    })?;

    let version = required_string(&scope, "version")?;
    let url = required_string(&scope, "url")?;
    if !(url.starts_with("https://") || url.starts_with("http://") || url.starts_with("file://")) {
        return Err(FormulaError::InvalidField {
            field: "url",
            reason: format!("unsupported scheme: {}", url),
        });
    }
    let sha256 = Sha256Digest::parse(&required_string(&scope, "sha256")?)?;

    Ok(Formula {
        name,
        desc: optional_string(&scope, "desc")?,
        homepage: optional_string(&scope, "homepage")?,
        version,
        license: optional_string(&scope, "license")?,
        url,
        sha256,
        install: read_install(&scope)?,
        test: read_test(&scope)?,
        source: None,
    })
}

fn formula_engine() -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");
    engine.on_print(|_| {});
    engine.on_debug(|_, _, _| {});
    engine
}

fn variable(scope: &Scope, name: &str) -> Option<Dynamic> {
    scope
        .get_value::<Dynamic>(name)
        .filter(|value| !value.is_unit())
}

fn optional_string(scope: &Scope, field: &'static str) -> Result<Option<String>, FormulaError> {
    match variable(scope, field) {
        None => Ok(None),
        Some(value) => value
            .into_string()
            .map(Some)
            .map_err(|ty| FormulaError::InvalidField {
                field,
                reason: format!("expected a string, got {}", ty),
            }),
    }
}

fn required_string(scope: &Scope, field: &'static str) -> Result<String, FormulaError> {
    match optional_string(scope, field)? {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => Err(FormulaError::MissingField(field)),
    }
}

/// Map form of an install entry
#[derive(Debug, Deserialize)]
struct TargetEntry {
    file: String,
    #[serde(default)]
    to: Option<String>,
    #[serde(default)]
    rename: Option<String>,
    #[serde(default)]
    mode: Option<i64>,
}

fn read_install(scope: &Scope) -> Result<Vec<InstallTarget>, FormulaError> {
    let entries = variable(scope, "install")
        .ok_or(FormulaError::MissingField("install"))?
        .into_array()
        .map_err(|ty| invalid_install(format!("expected an array, got {}", ty)))?;

    if entries.is_empty() {
        return Err(invalid_install("no install targets".to_string()));
    }

    entries.into_iter().map(parse_target).collect()
}

fn parse_target(entry: Dynamic) -> Result<InstallTarget, FormulaError> {
    let target = if entry.is_string() {
        TargetEntry {
            file: entry
                .into_string()
                .map_err(|ty| invalid_install(format!("expected a string, got {}", ty)))?,
            to: None,
            rename: None,
            mode: None,
        }
    } else if entry.is_map() {
        rhai::serde::from_dynamic::<TargetEntry>(&entry)
            .map_err(|e| invalid_install(e.to_string()))?
    } else {
        return Err(invalid_install(format!(
            "entries must be strings or maps, got {}",
            entry.type_name()
        )));
    };

    if !is_safe_relative(&target.file) {
        return Err(invalid_install(format!("unsafe file path: {}", target.file)));
    }
    if let Some(rename) = &target.rename
        && (rename.is_empty() || rename.contains('/') || rename == "." || rename == "..")
    {
        return Err(invalid_install(format!("invalid rename: {}", rename)));
    }

    let to = match target.to.as_deref() {
        None => DestinationKind::Bin,
        Some(kind) => DestinationKind::parse(kind)
            .ok_or_else(|| invalid_install(format!("unknown destination: {}", kind)))?,
    };

    let mode = match target.mode {
        None => None,
        Some(m) if (0..=0o7777).contains(&m) => Some(m as u32),
        Some(m) => return Err(invalid_install(format!("invalid mode: {:o}", m))),
    };

    Ok(InstallTarget {
        file: target.file,
        to,
        rename: target.rename,
        mode,
    })
}

fn read_test(scope: &Scope) -> Result<Option<VerifyCommand>, FormulaError> {
    let Some(value) = variable(scope, "test") else {
        return Ok(None);
    };
    let invalid = |reason: String| FormulaError::InvalidField {
        field: "test",
        reason,
    };

    let mut words = value
        .into_array()
        .map_err(|ty| invalid(format!("expected an array of strings, got {}", ty)))?
        .into_iter()
        .map(|w| {
            w.into_string()
                .map_err(|ty| invalid(format!("expected a string, got {}", ty)))
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter();

    let program = words
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid("empty command".to_string()))?;

    Ok(Some(VerifyCommand {
        program,
        args: words.collect(),
        expect_output: optional_string(scope, "test_output")?,
    }))
}

fn invalid_install(reason: String) -> FormulaError {
    FormulaError::InvalidField {
        field: "install",
        reason,
    }
}

/// Relative, non-empty, and free of `..` components
fn is_safe_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && !p.is_absolute()
        && p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
