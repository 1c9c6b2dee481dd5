//! The six smoke checks run against a staged artifact.
//!
//! Every check reads from the artifact directory only. Anything that would
//! execute package code (import sanity, subsystem init) goes through
//! [`crate::process`] so it runs in a child with its own timeout.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use super::report::CheckResult;
use super::ValidationSettings;
use crate::process::{self, ProcessOutput, ProcessSpec};
use crate::staging::checksum::compute_checksums;
use crate::staging::manifest::ArtifactManifest;
use crate::staging::store::{ENV_DIR, SOURCE_DIR};

/// Bytes of child output kept in check details.
const DETAIL_OUTPUT_LIMIT: usize = 2048;

/// Check identifiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    StructuralIntegrity,
    ImportSanity,
    ConfigParsing,
    RegistryPresence,
    TemplateAssets,
    SubsystemInit,
}

impl CheckKind {
    pub const ALL: [CheckKind; 6] = [
        CheckKind::StructuralIntegrity,
        CheckKind::ImportSanity,
        CheckKind::ConfigParsing,
        CheckKind::RegistryPresence,
        CheckKind::TemplateAssets,
        CheckKind::SubsystemInit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CheckKind::StructuralIntegrity => "structural_integrity",
            CheckKind::ImportSanity => "import_sanity",
            CheckKind::ConfigParsing => "config_parsing",
            CheckKind::RegistryPresence => "registry_presence",
            CheckKind::TemplateAssets => "template_assets",
            CheckKind::SubsystemInit => "subsystem_init",
        }
    }

    pub fn run(&self, ctx: &CheckContext) -> CheckResult {
        match self {
            CheckKind::StructuralIntegrity => structural_integrity(ctx),
            CheckKind::ImportSanity => import_sanity(ctx),
            CheckKind::ConfigParsing => config_parsing(ctx),
            CheckKind::RegistryPresence => registry_presence(ctx),
            CheckKind::TemplateAssets => template_assets(ctx),
            CheckKind::SubsystemInit => subsystem_init(ctx),
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs shared by all checks of one run.
#[derive(Debug, Clone)]
pub struct CheckContext {
    pub version: String,
    pub artifact_dir: PathBuf,
    pub manifest: Option<ArtifactManifest>,
    pub settings: ValidationSettings,
    /// Budget for one check (already capped by the suite deadline)
    pub timeout: Duration,
}

impl CheckContext {
    fn source_dir(&self) -> PathBuf {
        self.artifact_dir.join(SOURCE_DIR)
    }

    fn env_dir(&self) -> PathBuf {
        self.artifact_dir.join(ENV_DIR)
    }

    /// Resolve a declared relative path inside the artifact. Absolute paths
    /// and `..` components are refused.
    fn resolve(&self, declared: &str) -> Option<PathBuf> {
        let rel = Path::new(declared);
        let confined = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if declared.is_empty() || !confined {
            return None;
        }
        Some(self.artifact_dir.join(rel))
    }

    fn template_vars(&self) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("env", self.env_dir().to_string_lossy().into_owned());
        vars.insert("source", self.source_dir().to_string_lossy().into_owned());
        vars.insert("artifact", self.artifact_dir.to_string_lossy().into_owned());
        vars.insert("version", self.version.clone());
        if let Some(module) = &self.settings.primary_module {
            vars.insert("module", module.clone());
        }
        vars
    }
}

fn structural_integrity(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::StructuralIntegrity.name();
    if !ctx.artifact_dir.is_dir() {
        return CheckResult::fail(
            name,
            format!("artifact directory {} does not exist", ctx.artifact_dir.display()),
            json!({}),
        );
    }
    let Some(manifest) = &ctx.manifest else {
        return CheckResult::fail(name, "manifest.json is missing or unreadable", json!({}));
    };
    if manifest.version.to_string() != ctx.version {
        return CheckResult::fail(
            name,
            format!(
                "manifest describes {} but artifact is filed under {}",
                manifest.version, ctx.version
            ),
            json!({}),
        );
    }

    let mut missing = Vec::new();
    let mut invalid = Vec::new();
    let declared = [SOURCE_DIR, ENV_DIR]
        .into_iter()
        .map(str::to_string)
        .chain(ctx.settings.required_paths.iter().cloned());
    for rel in declared {
        match ctx.resolve(&rel) {
            Some(path) if path.exists() => {}
            Some(_) => missing.push(rel),
            None => invalid.push(rel),
        }
    }

    let recomputed = compute_checksums(&ctx.source_dir()).map(|c| c.tree_hash);
    let tree_hash_matches = matches!(&recomputed, Ok(h) if *h == manifest.checksums.tree_hash);
    let details = json!({
        "missing": missing,
        "invalid": invalid,
        "tree_hash": recomputed.as_ref().ok(),
        "tree_hash_matches": tree_hash_matches,
    });

    if !invalid.is_empty() {
        return CheckResult::fail(
            name,
            format!("paths escape the artifact: {}", invalid.join(", ")),
            details,
        );
    }
    if !missing.is_empty() {
        return CheckResult::fail(
            name,
            format!("missing required paths: {}", missing.join(", ")),
            details,
        );
    }
    match recomputed {
        Err(e) => CheckResult::fail(name, format!("cannot checksum source tree: {}", e), details),
        Ok(_) if !tree_hash_matches => CheckResult::fail(
            name,
            "source tree hash does not match the manifest",
            details,
        ),
        Ok(_) => CheckResult::pass(name, details),
    }
}

fn import_sanity(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::ImportSanity.name();
    let Some(module) = &ctx.settings.primary_module else {
        return CheckResult::fail(name, "no primary module declared", json!({}));
    };
    run_isolated(name, ctx, &ctx.settings.import_command, json!({ "module": module }))
}

fn config_parsing(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::ConfigParsing.name();
    if ctx.settings.config_files.is_empty() {
        return CheckResult::pass(name, json!({ "note": "no configuration files declared" }));
    }

    let mut parsed = Vec::new();
    let mut errors = Vec::new();
    for declared in &ctx.settings.config_files {
        let Some(path) = ctx.resolve(declared) else {
            errors.push(format!("{}: path escapes the artifact", declared));
            continue;
        };
        match parse_config(&path) {
            Ok(format) => parsed.push(json!({ "path": declared, "format": format })),
            Err(e) => errors.push(format!("{}: {}", declared, e)),
        }
    }

    let details = json!({ "parsed": parsed, "errors": errors });
    if errors.is_empty() {
        CheckResult::pass(name, details)
    } else {
        CheckResult::fail(name, errors.join("; "), details)
    }
}

fn parse_config(path: &Path) -> Result<&'static str, String> {
    let raw = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => serde_json::from_str::<Value>(&raw)
            .map(|_| "json")
            .map_err(|e| e.to_string()),
        "toml" => toml::from_str::<toml::Value>(&raw)
            .map(|_| "toml")
            .map_err(|e| e.to_string()),
        "yaml" | "yml" => serde_yaml::from_str::<serde_yaml::Value>(&raw)
            .map(|_| "yaml")
            .map_err(|e| e.to_string()),
        other => Err(format!("unsupported configuration format '{}'", other)),
    }
}

fn registry_presence(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::RegistryPresence.name();
    let Some(declared) = &ctx.settings.plugin_dir else {
        return CheckResult::pass(name, json!({ "note": "no plugin directory declared" }));
    };
    let Some(dir) = ctx.resolve(declared) else {
        return CheckResult::fail(name, format!("{}: path escapes the artifact", declared), json!({}));
    };
    let entries = match fs::read_dir(&dir) {
        Ok(read) => read
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .count(),
        Err(e) => {
            return CheckResult::fail(
                name,
                format!("{}: {}", declared, e),
                json!({ "plugin_dir": declared }),
            )
        }
    };
    let details = json!({ "plugin_dir": declared, "entries": entries });
    if entries == 0 {
        CheckResult::fail(name, format!("{} is empty", declared), details)
    } else {
        CheckResult::pass(name, details)
    }
}

fn template_assets(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::TemplateAssets.name();
    let mut problems = Vec::new();
    for declared in &ctx.settings.templates {
        let Some(path) = ctx.resolve(declared) else {
            problems.push(format!("{}: path escapes the artifact", declared));
            continue;
        };
        match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => problems.push(format!("{}: empty", declared)),
            Ok(_) => {}
            Err(e) => problems.push(format!("{}: {}", declared, e)),
        }
    }
    let details = json!({ "templates": ctx.settings.templates, "problems": problems });
    if problems.is_empty() {
        CheckResult::pass(name, details)
    } else {
        CheckResult::fail(name, problems.join("; "), details)
    }
}

fn subsystem_init(ctx: &CheckContext) -> CheckResult {
    let name = CheckKind::SubsystemInit.name();
    match &ctx.settings.subsystem_command {
        None => CheckResult::pass(name, json!({ "placeholder": true })),
        Some(command) => run_isolated(name, ctx, command, json!({ "placeholder": false })),
    }
}

/// Run a command template in a child process confined to the check budget.
fn run_isolated(name: &str, ctx: &CheckContext, template: &[String], mut details: Value) -> CheckResult {
    let spec = match ProcessSpec::from_template(template, &ctx.template_vars()) {
        Ok(spec) => spec.cwd(&ctx.source_dir()),
        Err(e) => return CheckResult::fail(name, e.to_string(), details),
    };
    let command = spec.display();
    details["command"] = json!(command);
    tracing::debug!(check = name, %command, "spawning isolated check");

    match process::run(&spec, ctx.timeout) {
        Ok(out) => {
            annotate(&mut details, &out);
            if out.success() {
                CheckResult::pass(name, details)
            } else {
                CheckResult::fail(name, out.describe_failure(), details)
            }
        }
        Err(e) => CheckResult::fail(name, e.to_string(), details),
    }
}

fn annotate(details: &mut Value, out: &ProcessOutput) {
    details["exit_code"] = json!(out.exit_code);
    details["timed_out"] = json!(out.timed_out);
    details["stdout"] = json!(tail(&out.stdout));
    details["stderr"] = json!(tail(&out.stderr));
}

fn tail(text: &str) -> &str {
    if text.len() <= DETAIL_OUTPUT_LIMIT {
        return text;
    }
    let mut start = text.len() - DETAIL_OUTPUT_LIMIT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
