// hops-core/src/build/plan.rs
//! Turns a formula plus its effective options into a concrete, ordered list
//! of commands. Nothing in this module touches the filesystem or spawns
//! processes.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hops_aio::CommandSpec;
use hops_common::config::Config;
use hops_common::dependency::Requirement;
use hops_common::error::Result;
use hops_common::fetch::FetchRequest;
use hops_common::model::condition::{holds, EvalContext};
use hops_common::model::formula::{ArgPreset, ArgTemplate, CompilerFailure, Phase, StepTemplate};
use hops_common::model::layout::Category;
use hops_common::model::options::{EnabledOptions, OptionKind};
use hops_common::model::platform::{Compiler, Platform};
use hops_common::model::Formula;
use hops_common::template::TemplateVars;
use tracing::debug;

use super::env::{BuildEnvironment, DependencyPrefix, EnvInputs};

const AUTOTOOLS_ARGS: &[&str] = &[
    "--prefix={prefix}",
    "--disable-dependency-tracking",
    "--disable-silent-rules",
];

const CMAKE_ARGS: &[&str] = &[
    "-DCMAKE_INSTALL_PREFIX={prefix}",
    "-DCMAKE_BUILD_TYPE=Release",
    "-DCMAKE_FIND_FRAMEWORK=LAST",
    "-DCMAKE_VERBOSE_MAKEFILE=ON",
    "-Wno-dev",
];

/// Directories one build works in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    pub build_root: PathBuf,
    /// Unpacked sources; steps run here unless they say otherwise.
    pub buildpath: PathBuf,
    /// `DESTDIR` of the build.
    pub staging: PathBuf,
    pub patches_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub keg: PathBuf,
    pub opt: PathBuf,
    pub hops_prefix: PathBuf,
}

impl BuildLayout {
    pub fn new(
        build_root: impl Into<PathBuf>,
        keg: impl Into<PathBuf>,
        opt: impl Into<PathBuf>,
        hops_prefix: impl Into<PathBuf>,
    ) -> Self {
        let build_root = build_root.into();
        Self {
            buildpath: build_root.join("src"),
            staging: build_root.join("stage"),
            patches_dir: build_root.join("patches"),
            resources_dir: build_root.join("resources"),
            tmp_dir: build_root.join("tmp"),
            build_root,
            keg: keg.into(),
            opt: opt.into(),
            hops_prefix: hops_prefix.into(),
        }
    }

    /// `<tmp>/<name>-<version>-<hash16>` with the keg and opt paths of `config`.
    pub fn for_formula(config: &Config, formula: &Formula, build_hash: &str) -> Self {
        let version = formula.version_str_full();
        Self::new(
            config
                .tmp_dir()
                .join(build_key(formula.name(), &version, build_hash)),
            formula.install_prefix(&config.cellar_dir()),
            config.formula_opt_path(formula.name()),
            config.hops_root(),
        )
    }
}

/// Identifies one (name, version, configuration) build, for locks and
/// scratch directories.
pub fn build_key(name: &str, version: &str, build_hash: &str) -> String {
    let short = build_hash.get(..16).unwrap_or(build_hash);
    format!("{name}-{version}-{short}")
}

/// Identifies one keg. Builds of the same version with different options
/// share it.
pub fn keg_key(name: &str, version: &str) -> String {
    format!("{name}-{version}.keg")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub name: String,
    pub phase: Phase,
    pub command: CommandSpec,
    pub best_effort: bool,
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.phase, self.name, self.command.display_line())?;
        if self.best_effort {
            write!(f, " (best effort)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedResource {
    pub name: String,
    pub request: FetchRequest,
    /// Where the fetched file is copied; `{resource:<name>}` renders to this.
    pub dest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSource {
    Inline(String),
    Remote(FetchRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedPatch {
    /// 1-based position among the formula's declared patches.
    pub index: usize,
    pub source: PatchSource,
    pub path: PathBuf,
}

/// Everything needed to run one build, fully rendered.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    pub formula: String,
    pub version: String,
    pub source: FetchRequest,
    pub resources: Vec<StagedResource>,
    pub patches: Vec<StagedPatch>,
    pub steps: Vec<PlannedStep>,
    pub env: BuildEnvironment,
    pub layout: BuildLayout,
    pub requirements: Vec<Requirement>,
    pub fails_with: Vec<CompilerFailure>,
    pub compiler: Compiler,
}

pub struct PlanInputs<'a> {
    pub formula: &'a Formula,
    pub options: &'a EnabledOptions,
    pub platform: &'a Platform,
    /// Installed prefixes of the enabled build closure.
    pub dependencies: &'a [DependencyPrefix],
    pub layout: &'a BuildLayout,
    pub jobs: usize,
    pub base_env: &'a BTreeMap<String, String>,
    pub step_timeout: Option<Duration>,
}

/// Install-location placeholders shared by planning, materializing and
/// verification.
pub fn install_vars(
    formula: &Formula,
    keg: &Path,
    opt: &Path,
    hops_prefix: &Path,
    platform: &Platform,
) -> TemplateVars {
    let mut vars = TemplateVars::for_formula(formula.name());
    let path = |p: PathBuf| p.display().to_string();
    vars.insert("prefix", path(keg.to_path_buf()))
        .insert("opt", path(opt.to_path_buf()))
        .insert("version", formula.version_str_full())
        .insert("name", formula.name())
        .insert("os", platform.os.as_str())
        .insert("arch", platform.arch.as_str())
        .insert("hops_prefix", path(hops_prefix.to_path_buf()));
    for category in Category::ALL {
        let key = match category {
            Category::Prefix => continue,
            other => other.as_str(),
        };
        vars.insert(key, path(keg.join(category.relative_dir(formula.name()))));
    }
    vars
}

/// Adds `{dep:<name>}` and friends for each dependency.
pub fn insert_dependency_vars(vars: &mut TemplateVars, dependencies: &[DependencyPrefix]) {
    for dep in dependencies {
        let opt = dep.opt.display().to_string();
        vars.insert(format!("dep:{}", dep.name), opt.clone())
            .insert(format!("dep:{}.opt", dep.name), opt.clone())
            .insert(
                format!("dep:{}.prefix", dep.name),
                dep.prefix.display().to_string(),
            );
        for category in Category::ALL {
            let value = match category {
                Category::Prefix => opt.clone(),
                other => dep.opt.join(other.relative_dir(&dep.name)).display().to_string(),
            };
            vars.insert(format!("dep:{}.{}", dep.name, category.as_str()), value);
        }
    }
}

pub fn compute_plan(inputs: &PlanInputs<'_>) -> Result<BuildPlan> {
    let formula = inputs.formula;
    let layout = inputs.layout;
    let ctx = EvalContext {
        options: inputs.options,
        platform: inputs.platform,
    };
    let jobs = inputs.jobs.max(1);
    debug!(
        "Planning build of {} {} with options {:?}",
        formula.name(),
        formula.version_str_full(),
        inputs.options.canonical()
    );

    let mut vars = install_vars(
        formula,
        &layout.keg,
        &layout.opt,
        &layout.hops_prefix,
        inputs.platform,
    );
    vars.insert("buildpath", layout.buildpath.display().to_string())
        .insert("staging", layout.staging.display().to_string())
        .insert("jobs", jobs.to_string());
    insert_dependency_vars(&mut vars, inputs.dependencies);

    for decl in formula.declared_options() {
        if decl.kind() == Some(OptionKind::Choice) {
            if let Some(value) = inputs.options.choice(&decl.name) {
                vars.insert(format!("option:{}", decl.name), value);
            }
        }
    }

    let resources: Vec<StagedResource> = formula
        .resources
        .iter()
        .map(|r| {
            let request =
                FetchRequest::from_source(format!("{}-{}", formula.name(), r.name), &r.source);
            let dest = layout.resources_dir.join(&r.name).join(&request.file_name);
            StagedResource {
                name: r.name.clone(),
                request,
                dest,
            }
        })
        .collect();
    for resource in &resources {
        vars.insert(
            format!("resource:{}", resource.name),
            resource.dest.display().to_string(),
        );
    }

    let mut patches = Vec::new();
    for (i, patch) in formula.patches.iter().enumerate() {
        if !holds(patch.when.as_ref(), &ctx) {
            continue;
        }
        let index = i + 1;
        let path = layout.patches_dir.join(format!("{index:03}.patch"));
        let source = match (&patch.data, &patch.url) {
            (Some(data), _) => PatchSource::Inline(data.clone()),
            (None, Some(url)) => PatchSource::Remote(FetchRequest {
                name: format!("{}-patch-{index}", formula.name()),
                url: url.clone(),
                mirrors: Vec::new(),
                sha256: patch.sha256.clone().unwrap_or_default(),
                file_name: format!("{index:03}.patch"),
            }),
            (None, None) => continue,
        };
        vars.insert(format!("patch:{index}"), path.display().to_string());
        patches.push((patch, StagedPatch { index, source, path }));
    }

    let mut env = BuildEnvironment::new(&EnvInputs {
        base_env: inputs.base_env,
        dependencies: inputs.dependencies,
        hops_prefix: &layout.hops_prefix,
        staging: &layout.staging,
        compiler: &inputs.platform.compiler,
        jobs,
        tmp_dir: Some(layout.tmp_dir.as_path()),
    });
    let directive_vars = vars.clone().with_env(env.vars().clone());
    env.apply_directives(&formula.env, &ctx, &directive_vars)?;
    let vars = vars.with_env(env.vars().clone());

    let mut steps: Vec<PlannedStep> = patches
        .iter()
        .map(|(spec, staged)| {
            let cwd = match &spec.directory {
                Some(dir) => layout.buildpath.join(dir),
                None => layout.buildpath.clone(),
            };
            PlannedStep {
                name: format!("patch-{:03}", staged.index),
                phase: Phase::Patch,
                command: CommandSpec::new("patch")
                    .args([
                        format!("-p{}", spec.strip),
                        "-i".to_string(),
                        staged.path.display().to_string(),
                    ])
                    .cwd(cwd)
                    .envs(env.vars().clone())
                    .clear_env()
                    .timeout(inputs.step_timeout),
                best_effort: false,
            }
        })
        .collect();

    for template in formula.steps.iter().filter(|s| holds(s.when.as_ref(), &ctx)) {
        steps.push(render_step(template, &ctx, &vars, &env, layout, inputs.step_timeout)?);
    }
    steps.sort_by_key(|s| s.phase);

    Ok(BuildPlan {
        formula: formula.name().to_string(),
        version: formula.version_str_full(),
        source: FetchRequest::from_source(formula.name(), &formula.source),
        resources,
        patches: patches.into_iter().map(|(_, staged)| staged).collect(),
        steps,
        env,
        layout: layout.clone(),
        requirements: formula
            .enabled_requirements(&ctx)
            .into_iter()
            .cloned()
            .collect(),
        fails_with: formula.fails_with.clone(),
        compiler: inputs.platform.compiler.clone(),
    })
}

fn render_step(
    template: &StepTemplate,
    ctx: &EvalContext<'_>,
    vars: &TemplateVars,
    env: &BuildEnvironment,
    layout: &BuildLayout,
    default_timeout: Option<Duration>,
) -> Result<PlannedStep> {
    let preset: &[&str] = match template.preset {
        Some(ArgPreset::Autotools) => AUTOTOOLS_ARGS,
        Some(ArgPreset::Cmake) => CMAKE_ARGS,
        None => &[],
    };
    let mut args = Vec::new();
    for arg in preset {
        args.push(vars.render(arg)?);
    }
    for arg in &template.args {
        match arg {
            ArgTemplate::Plain(a) => args.push(vars.render(a)?),
            ArgTemplate::Conditional {
                when,
                args: then,
                otherwise,
            } => {
                let chosen = if when.evaluate(ctx) { then } else { otherwise };
                args.extend(vars.render_all(chosen)?);
            }
        }
    }

    let cwd = match &template.cwd {
        Some(dir) => layout.buildpath.join(vars.render(dir)?),
        None => layout.buildpath.clone(),
    };
    let mut step_env = env.vars().clone();
    for (key, value) in &template.env {
        step_env.insert(key.clone(), vars.render(value)?);
    }
    if template.serial {
        step_env.insert("MAKEFLAGS".to_string(), "-j1".to_string());
    }

    let timeout = template
        .timeout_secs
        .map(Duration::from_secs)
        .or(default_timeout);
    Ok(PlannedStep {
        name: template.name.clone(),
        phase: template.phase,
        command: CommandSpec::new(vars.render(&template.command)?)
            .args(args)
            .cwd(cwd)
            .envs(step_env)
            .clear_env()
            .timeout(timeout),
        best_effort: template.best_effort,
    })
}

#[cfg(test)]
mod tests {
    use hops_common::dependency::DependencyTag;
    use hops_common::model::options::OptionSelection;
    use hops_common::model::platform::{Arch, CompilerFamily, OsFamily, ToolVersion};

    use super::*;

    const SHA: &str = "9c9152e74134b68b0f3a1c7083764adc1cb56fd8336bec003fd0ca550cd2461d";

    fn formula(extra: &str) -> Formula {
        Formula::from_json_str(&format!(
            r#"{{
                "name": "r",
                "version": "3.2.2",
                "revision": 1,
                "source": {{"url": "http://cran.rstudio.com/src/base/R-3/R-3.2.2.tar.gz", "sha256": "{SHA}"}}
                {extra}
            }}"#
        ))
        .unwrap()
    }

    fn platform(family: CompilerFamily) -> Platform {
        Platform {
            os: OsFamily::Linux,
            arch: Arch::X86_64,
            os_version: None,
            compiler: Compiler {
                family,
                version: ToolVersion::parse("7.0.0").unwrap(),
            },
        }
    }

    fn layout() -> BuildLayout {
        BuildLayout::new(
            "/opt/hops/tmp/r-3.2.2_1-0123456789abcdef",
            "/opt/hops/Cellar/r/3.2.2_1",
            "/opt/hops/opt/r",
            "/opt/hops",
        )
    }

    fn dep(name: &str) -> DependencyPrefix {
        DependencyPrefix {
            name: name.to_string(),
            prefix: PathBuf::from(format!("/opt/hops/Cellar/{name}/1.0")),
            opt: PathBuf::from(format!("/opt/hops/opt/{name}")),
            tags: DependencyTag::RUNTIME,
        }
    }

    fn plan_with(
        formula: &Formula,
        selection: &[&str],
        family: CompilerFamily,
        deps: &[DependencyPrefix],
    ) -> Result<BuildPlan> {
        let options = formula.resolve_options(&OptionSelection::parse(selection.iter().copied())?)?;
        let platform = platform(family);
        let layout = layout();
        let base_env = BTreeMap::from([("HOME".to_string(), "/home/me".to_string())]);
        compute_plan(&PlanInputs {
            formula,
            options: &options,
            platform: &platform,
            dependencies: deps,
            layout: &layout,
            jobs: 8,
            base_env: &base_env,
            step_timeout: Some(Duration::from_secs(60)),
        })
    }

    #[test]
    fn renders_presets_and_orders_by_phase() {
        let f = formula(
            r#", "dependencies": ["readline"],
                 "steps": [
                    {"name": "install", "phase": "install", "command": "make", "args": ["install"]},
                    {"name": "make", "command": "make"},
                    {"name": "configure", "phase": "configure", "command": "./configure",
                     "preset": "autotools",
                     "args": ["--with-readline={dep:readline.lib}", "--libdir={lib}"]}
                 ]"#,
        );
        let plan = plan_with(&f, &[], CompilerFamily::Clang, &[dep("readline")]).unwrap();
        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["configure", "make", "install"]);

        let configure = &plan.steps[0].command;
        assert_eq!(
            configure.args,
            vec![
                "--prefix=/opt/hops/Cellar/r/3.2.2_1",
                "--disable-dependency-tracking",
                "--disable-silent-rules",
                "--with-readline=/opt/hops/opt/readline/lib",
                "--libdir=/opt/hops/Cellar/r/3.2.2_1/lib",
            ]
        );
        assert_eq!(
            configure.cwd.as_deref(),
            Some(Path::new("/opt/hops/tmp/r-3.2.2_1-0123456789abcdef/src"))
        );
        assert!(configure.clear_env);
        assert_eq!(configure.env.get("HOME").map(String::as_str), Some("/home/me"));
        assert_eq!(configure.timeout, Some(Duration::from_secs(60)));
        assert_eq!(plan.source.file_name, "R-3.2.2.tar.gz");
    }

    #[test]
    fn conditional_args_and_serial_steps() {
        let f = formula(
            r#", "options": [{"name": "without-check"}, {"name": "blas", "values": ["accelerate", "rblas"]}],
                 "steps": [
                    {"name": "configure", "phase": "configure", "command": "./configure",
                     "args": [{"when": {"os": "linux"}, "args": ["--enable-R-shlib"], "else": ["--enable-R-framework"]},
                              "--with-blas={option:blas}"]},
                    {"name": "check", "phase": "test", "command": "make", "args": ["check"],
                     "serial": true, "best_effort": true, "when": {"with": "check"}}
                 ]"#,
        );
        let plan = plan_with(&f, &["blas=rblas"], CompilerFamily::Clang, &[]).unwrap();
        assert_eq!(
            plan.steps[0].command.args,
            vec!["--enable-R-shlib", "--with-blas=rblas"]
        );
        let check = &plan.steps[1];
        assert!(check.best_effort);
        assert_eq!(check.command.env.get("MAKEFLAGS").map(String::as_str), Some("-j1"));
        assert_eq!(plan.env.get("MAKEFLAGS"), Some("-j8"));

        let skipped = plan_with(&f, &["without-check"], CompilerFamily::Clang, &[]).unwrap();
        assert_eq!(skipped.steps.len(), 1);
    }

    #[test]
    fn patches_become_leading_steps() {
        let f = formula(
            r#", "patches": [
                    {"data": "--- a/x\n+++ b/x\n", "when": {"os": "macos"}},
                    {"data": "--- a/y\n+++ b/y\n", "strip": 0, "directory": "src/nmath"}
                 ],
                 "steps": [{"name": "make", "command": "make", "args": ["PATCH={patch:2}"]}]"#,
        );
        let plan = plan_with(&f, &[], CompilerFamily::Clang, &[]).unwrap();
        assert_eq!(plan.patches.len(), 1);
        assert_eq!(plan.patches[0].index, 2);
        let patch = &plan.steps[0];
        assert_eq!(patch.name, "patch-002");
        assert_eq!(patch.command.program, "patch");
        assert_eq!(patch.command.args[0], "-p0");
        assert!(patch.command.cwd.as_ref().unwrap().ends_with("src/src/nmath"));
        assert!(plan.steps[1].command.args[0].ends_with("patches/002.patch"));
    }

    #[test]
    fn disabled_patch_placeholder_does_not_render() {
        let f = formula(
            r#", "patches": [{"data": "x", "when": {"os": "macos"}}],
                 "steps": [{"name": "make", "command": "make", "args": ["{patch:1}"]}]"#,
        );
        assert!(plan_with(&f, &[], CompilerFamily::Clang, &[]).is_err());
    }

    #[test]
    fn disabled_optional_dependency_leaves_no_trace() {
        let f = formula(
            r#", "dependencies": [{"name": "openblas", "tags": ["optional"]}, "readline"],
                 "steps": [{"name": "configure", "phase": "configure", "command": "./configure",
                            "args": [{"when": {"with": "openblas"},
                                      "args": ["--with-blas=-L{dep:openblas.lib} -lopenblas"]}]}]"#,
        );
        let without = plan_with(&f, &[], CompilerFamily::Clang, &[dep("readline")]).unwrap();
        assert!(without.steps[0].command.args.is_empty());
        let rendered = format!("{:?}", without.env);
        assert!(!rendered.contains("openblas"));

        let with = plan_with(
            &f,
            &["with-openblas"],
            CompilerFamily::Clang,
            &[dep("readline"), dep("openblas")],
        )
        .unwrap();
        assert_eq!(
            with.steps[0].command.args,
            vec!["--with-blas=-L/opt/hops/opt/openblas/lib -lopenblas"]
        );
        assert!(with.env.get("LDFLAGS").unwrap().contains("openblas"));
    }

    #[test]
    fn resources_render_to_staged_files() {
        let f = formula(
            r#", "resources": [{"name": "eigen", "url": "https://bitbucket.org/eigen/eigen/get/3.2.2.tar.gz",
                                "sha256": "318d68c5a9c20ec20d08f1a50a10fb4991a25fd5474a969e771cd9f2a79c9e5f"}],
                 "steps": [{"name": "configure", "command": "./configure",
                            "args": ["-DEIGEN_TAR_SOURCE={resource:eigen}"]}]"#,
        );
        let plan = plan_with(&f, &[], CompilerFamily::Gcc, &[]).unwrap();
        assert_eq!(plan.resources[0].request.name, "r-eigen");
        assert!(plan.steps[0].command.args[0].ends_with("resources/eigen/3.2.2.tar.gz"));
        assert_eq!(plan.env.get("CC"), Some("gcc"));
    }

    #[test]
    fn build_key_truncates_hash() {
        assert_eq!(
            build_key("plr", "8.3.0.16_2", "0123456789abcdef0123"),
            "plr-8.3.0.16_2-0123456789abcdef"
        );
        assert_eq!(build_key("plr", "1", "abc"), "plr-1-abc");
        assert_eq!(keg_key("plr", "8.3.0.16_2"), "plr-8.3.0.16_2.keg");
    }
}
