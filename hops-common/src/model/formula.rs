// hops-common/src/model/formula.rs
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::condition::{holds, Condition, EvalContext};
use super::layout::{Category, InstallSpec};
use super::options::{EnabledOptions, OptionDecl, OptionKind, OptionSelection};
use super::platform::{Compiler, CompilerFamily, ToolVersion};
use super::verify::{Probe, ServiceStart, VerifyAction, VerifySpec};
use crate::dependency::{Dependency, DependencyTag, Requirement};
use crate::error::{HopsError, Result};
use crate::template::{placeholders, BUILTIN_PLACEHOLDERS};

/// A downloadable archive or file with its expected checksum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub url: String,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SourceSpec {
    /// Last path segment of the URL, used to name cached downloads.
    pub fn file_name(&self) -> String {
        let trimmed = self.url.split(['?', '#']).next().unwrap_or(&self.url);
        trimmed
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string()
    }
}

/// An additional source fetched alongside the main one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(flatten)]
    pub source: SourceSpec,
}

/// A patch applied to the unpacked sources before the first step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
    /// Inline unified diff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default = "default_strip")]
    pub strip: u32,
    /// Directory (relative to the build path) the patch applies in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

fn default_strip() -> u32 {
    1
}

/// Declares that the formula cannot be built with a compiler family, up to
/// and including `build` when given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerFailure {
    pub compiler: CompilerFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<ToolVersion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl CompilerFailure {
    pub fn matches(&self, compiler: &Compiler) -> bool {
        compiler.family == self.compiler
            && self
                .build
                .as_ref()
                .is_none_or(|limit| compiler.version <= *limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvOp {
    Set,
    Append,
    Prepend,
    /// Removes `value` from the variable, or the whole variable when empty.
    Remove,
}

/// A change to the build environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvDirective {
    pub var: String,
    pub op: EnvOp,
    #[serde(default)]
    pub value: String,
    /// Separator for append/prepend; a space unless given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Patch,
    Configure,
    #[default]
    Build,
    Test,
    Install,
}

/// Standard argument sets for common build systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgPreset {
    Autotools,
    Cmake,
}

/// One argument, or a group of arguments included only when `when` holds
/// (with `else` as the alternative).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgTemplate {
    Plain(String),
    Conditional {
        when: Condition,
        args: Vec<String>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<String>,
    },
}

/// Template of one build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub name: String,
    #[serde(default)]
    pub phase: Phase,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<ArgPreset>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<ArgTemplate>,
    /// Working directory relative to the build path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Failure is logged and the build continues.
    #[serde(default)]
    pub best_effort: bool,
    /// Runs without parallel jobs.
    #[serde(default)]
    pub serial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

/// Immutable declarative description of one installable package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    pub source: SourceSpec,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<Requirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<OptionDecl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fails_with: Vec<CompilerFailure>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvDirective>,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
    #[serde(default)]
    pub install: InstallSpec,
    #[serde(default, skip_serializing_if = "VerifySpec::is_empty")]
    pub test: VerifySpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caveats: Option<String>,
}

impl Formula {
    /// Parses and validates a formula document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let formula: Formula = serde_json::from_str(json)?;
        formula.validate()?;
        Ok(formula)
    }

    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading formula from {}", path.display());
        let raw = fs::read_to_string(path)?;
        let formula = Self::from_json_str(&raw).map_err(|e| match e {
            HopsError::Json(err) => HopsError::malformed(
                path.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                err.to_string(),
            ),
            other => other,
        })?;
        Ok(formula)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Version including the revision suffix, as used for keg directories.
    pub fn version_str_full(&self) -> String {
        if self.revision > 0 {
            format!("{}_{}", self.version, self.revision)
        } else {
            self.version.clone()
        }
    }

    /// `<cellar>/<name>/<version>`.
    pub fn install_prefix(&self, cellar_path: &Path) -> PathBuf {
        cellar_path.join(&self.name).join(self.version_str_full())
    }

    /// Explicit options plus the implicit `with-<dep>` of optional
    /// dependencies and `without-<dep>` of recommended ones.
    pub fn declared_options(&self) -> Vec<OptionDecl> {
        let mut declared = self.options.clone();
        let implicit = self
            .dependencies
            .iter()
            .map(|d| (&d.name, d.tags))
            .chain(self.requirements.iter().map(|r| (&r.name, r.tags)));
        for (name, tags) in implicit {
            let flag = if tags.contains(DependencyTag::RECOMMENDED) {
                format!("without-{name}")
            } else if tags.contains(DependencyTag::OPTIONAL) {
                format!("with-{name}")
            } else {
                continue;
            };
            if !declared.iter().any(|d| d.feature() == Some(name.as_str())) {
                declared.push(OptionDecl::flag(flag));
            }
        }
        declared
    }

    pub fn resolve_options(&self, selection: &OptionSelection) -> Result<EnabledOptions> {
        EnabledOptions::resolve(&self.name, &self.declared_options(), selection)
    }

    pub fn enabled_dependencies(
        &self,
        ctx: &EvalContext<'_>,
        include_test: bool,
    ) -> Vec<&Dependency> {
        self.dependencies
            .iter()
            .filter(|d| d.is_enabled(ctx, include_test))
            .collect()
    }

    pub fn enabled_requirements(&self, ctx: &EvalContext<'_>) -> Vec<&Requirement> {
        self.requirements
            .iter()
            .filter(|r| r.is_enabled(ctx))
            .collect()
    }

    pub fn enabled_patches(&self, ctx: &EvalContext<'_>) -> Vec<&PatchSpec> {
        self.patches
            .iter()
            .filter(|p| holds(p.when.as_ref(), ctx))
            .collect()
    }

    /// The first `fails_with` entry matching `compiler`.
    pub fn incompatible_compiler(&self, compiler: &Compiler) -> Option<&CompilerFailure> {
        self.fails_with.iter().find(|f| f.matches(compiler))
    }

    /// Checks the structural rules a formula must satisfy before use.
    pub fn validate(&self) -> Result<()> {
        let malformed = |reason: String| HopsError::malformed(&self.name, reason);

        if !is_valid_name(&self.name) {
            return Err(malformed(format!("invalid formula name '{}'", self.name)));
        }
        if self.version.trim().is_empty()
            || self.version.contains(|c: char| c.is_whitespace() || c == '/')
        {
            return Err(malformed(format!("invalid version '{}'", self.version)));
        }

        check_source(&self.name, "source", &self.source)?;
        let mut resource_names = BTreeSet::new();
        for resource in &self.resources {
            if !resource_names.insert(resource.name.as_str()) {
                return Err(malformed(format!("duplicate resource '{}'", resource.name)));
            }
            check_source(&self.name, &format!("resource '{}'", resource.name), &resource.source)?;
        }

        let mut seen_options = BTreeSet::new();
        for option in &self.options {
            option.validate(&self.name)?;
            if !seen_options.insert(option.name.as_str()) {
                return Err(malformed(format!("duplicate option '{}'", option.name)));
            }
        }
        let mut seen_features = BTreeSet::new();
        for feature in self.options.iter().filter_map(OptionDecl::feature) {
            if !seen_features.insert(feature) {
                return Err(malformed(format!(
                    "feature '{feature}' is declared by both with- and without- options"
                )));
            }
        }

        let mut dep_names = BTreeSet::new();
        for dep in &self.dependencies {
            if dep.name == self.name {
                return Err(malformed("formula depends on itself".to_string()));
            }
            if !is_valid_name(&dep.name) {
                return Err(malformed(format!("invalid dependency name '{}'", dep.name)));
            }
            if !dep_names.insert(dep.name.as_str()) {
                return Err(malformed(format!("dependency '{}' declared twice", dep.name)));
            }
        }

        let declared = self.declared_options();
        let choice_names: BTreeSet<&str> = declared
            .iter()
            .filter(|d| d.kind() == Some(OptionKind::Choice))
            .map(|d| d.name.as_str())
            .collect();

        for condition in self.conditions() {
            condition.check(&self.name, &declared)?;
        }

        for (index, patch) in self.patches.iter().enumerate() {
            match (&patch.data, &patch.url) {
                (Some(_), None) => {}
                (None, Some(url)) => {
                    check_url(&self.name, url)?;
                    match &patch.sha256 {
                        Some(sha) if is_sha256(sha) => {}
                        _ => {
                            return Err(malformed(format!(
                                "patch {} needs a valid sha256",
                                index + 1
                            )))
                        }
                    }
                }
                _ => {
                    return Err(malformed(format!(
                        "patch {} must declare exactly one of 'data' or 'url'",
                        index + 1
                    )))
                }
            }
        }

        if self
            .fails_with
            .iter()
            .any(|f| f.compiler == CompilerFamily::Unknown)
        {
            return Err(malformed("fails_with names an unknown compiler family".into()));
        }

        let mut step_names = BTreeSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() || step.command.trim().is_empty() {
                return Err(malformed("build steps need a name and a command".into()));
            }
            if !step_names.insert(step.name.as_str()) {
                return Err(malformed(format!("duplicate step name '{}'", step.name)));
            }
        }

        for template in self.templates() {
            let keys = placeholders(template).map_err(malformed)?;
            for key in keys {
                if !self.is_known_placeholder(&key, &resource_names, &dep_names, &choice_names) {
                    return Err(malformed(format!(
                        "unknown placeholder '{{{key}}}' in '{template}'"
                    )));
                }
            }
        }

        Ok(())
    }

    fn is_known_placeholder(
        &self,
        key: &str,
        resources: &BTreeSet<&str>,
        deps: &BTreeSet<&str>,
        choices: &BTreeSet<&str>,
    ) -> bool {
        if BUILTIN_PLACEHOLDERS.contains(&key) {
            return true;
        }
        let Some((kind, rest)) = key.split_once(':') else {
            return false;
        };
        match kind {
            "env" => !rest.is_empty(),
            "resource" => resources.contains(rest),
            "option" => choices.contains(rest),
            "patch" => rest
                .parse::<usize>()
                .is_ok_and(|n| n >= 1 && n <= self.patches.len()),
            "dep" => {
                let (dep, category) = match rest.split_once('.') {
                    Some((dep, category)) => (dep, Some(category)),
                    None => (rest, None),
                };
                deps.contains(dep)
                    && category.is_none_or(|c| {
                        c == "prefix"
                            || c == "opt"
                            || Category::ALL.iter().any(|cat| cat.as_str() == c)
                    })
            }
            _ => false,
        }
    }

    /// Every condition declared anywhere in the formula.
    fn conditions(&self) -> Vec<&Condition> {
        let mut all = Vec::new();
        all.extend(self.dependencies.iter().filter_map(|d| d.when.as_ref()));
        all.extend(self.requirements.iter().filter_map(|r| r.when.as_ref()));
        all.extend(self.patches.iter().filter_map(|p| p.when.as_ref()));
        all.extend(self.env.iter().filter_map(|e| e.when.as_ref()));
        for step in &self.steps {
            all.extend(step.when.as_ref());
            for arg in &step.args {
                if let ArgTemplate::Conditional { when, .. } = arg {
                    all.push(when);
                }
            }
        }
        all.extend(self.install.rules.iter().filter_map(|r| r.when.as_ref()));
        all.extend(self.install.links.iter().filter_map(|l| l.when.as_ref()));
        all.extend(self.install.shims.iter().filter_map(|s| s.when.as_ref()));
        all
    }

    /// Every template string declared anywhere in the formula.
    fn templates(&self) -> Vec<&str> {
        let mut all: Vec<&str> = Vec::new();
        all.extend(self.env.iter().map(|e| e.value.as_str()));
        for step in &self.steps {
            all.push(&step.command);
            all.extend(step.cwd.as_deref());
            all.extend(step.env.values().map(String::as_str));
            for arg in &step.args {
                match arg {
                    ArgTemplate::Plain(a) => all.push(a),
                    ArgTemplate::Conditional {
                        args, otherwise, ..
                    } => {
                        all.extend(args.iter().map(String::as_str));
                        all.extend(otherwise.iter().map(String::as_str));
                    }
                }
            }
        }
        for link in &self.install.links {
            all.push(&link.target);
        }
        for shim in &self.install.shims {
            all.push(&shim.target);
            all.extend(shim.env.values().map(String::as_str));
        }
        for action in &self.test.actions {
            match action {
                VerifyAction::Run {
                    command,
                    args,
                    env,
                    cwd,
                    ..
                } => {
                    all.push(command);
                    all.extend(args.iter().map(String::as_str));
                    all.extend(env.values().map(String::as_str));
                    all.extend(cwd.as_deref());
                }
                VerifyAction::Service(service) => {
                    let mut commands = Vec::new();
                    match &service.start {
                        ServiceStart::Spawn(cmd) => commands.push(cmd),
                        ServiceStart::Managed { start, stop } => {
                            commands.push(start);
                            commands.push(stop);
                        }
                    }
                    let probes = service
                        .detect
                        .iter()
                        .chain(service.readiness.probe.iter());
                    for probe in probes {
                        match probe {
                            Probe::PathExists(path) => all.push(path),
                            Probe::Command(cmd) => commands.push(cmd),
                        }
                    }
                    for cmd in commands {
                        all.push(&cmd.command);
                        all.extend(cmd.args.iter().map(String::as_str));
                        all.extend(cmd.env.values().map(String::as_str));
                    }
                }
            }
        }
        all
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && chars.all(|c| {
            c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '@' | '-')
        })
}

fn is_sha256(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_url(formula: &str, raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| HopsError::malformed(formula, format!("invalid URL '{raw}': {e}")))?;
    match parsed.scheme() {
        "https" | "http" | "file" => Ok(()),
        other => Err(HopsError::malformed(
            formula,
            format!("unsupported URL scheme '{other}' in '{raw}'"),
        )),
    }
}

fn check_source(formula: &str, what: &str, source: &SourceSpec) -> Result<()> {
    check_url(formula, &source.url)?;
    for mirror in &source.mirrors {
        check_url(formula, mirror)?;
    }
    if !is_sha256(&source.sha256) {
        return Err(HopsError::malformed(
            formula,
            format!("{what} checksum must be 64 hexadecimal digits"),
        ));
    }
    Ok(())
}
