// hops-core/src/build/executor.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hops_aio::extract::{extract_archive_async, infer_archive_root_dir, ArchiveKind};
use hops_aio::{CommandOutcome, CommandRunner};
use hops_common::error::{output_tail, HopsError, Result, StepFailure, OUTPUT_TAIL_LINES};
use hops_common::fetch::Fetcher;
use tracing::{debug, error, info, warn};

use super::plan::{BuildPlan, PatchSource, PlannedStep};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRecord {
    pub name: String,
    pub exit_code: Option<i32>,
    pub success: bool,
    pub duration: Duration,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub formula: String,
    pub staging: PathBuf,
    pub steps: Vec<StepRecord>,
    /// Best-effort steps that failed.
    pub warnings: Vec<String>,
}

/// Runs a [`BuildPlan`]: pre-checks, source staging, then each step in order.
pub struct BuildExecutor {
    runner: Arc<dyn CommandRunner>,
    fetcher: Arc<dyn Fetcher>,
    log_dir: Option<PathBuf>,
}

impl BuildExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            runner,
            fetcher,
            log_dir: None,
        }
    }

    /// Step logs go to `<dir>/<NN>.<step>.log`.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub async fn execute(&self, plan: &BuildPlan) -> Result<BuildReport> {
        self.precheck(plan)?;
        self.stage(plan).await?;
        self.run_steps(plan).await
    }

    /// Toolchain and requirement checks. Runs no commands.
    pub fn precheck(&self, plan: &BuildPlan) -> Result<()> {
        if let Some(failure) = plan.fails_with.iter().find(|f| f.matches(&plan.compiler)) {
            let bound = failure
                .build
                .as_ref()
                .map(|b| format!(" newer than {b}"))
                .unwrap_or_default();
            let err = HopsError::IncompatibleToolchain {
                formula: plan.formula.clone(),
                compiler: plan.compiler.family.to_string(),
                version: plan.compiler.version.to_string(),
                cause: failure.cause.clone(),
                hint: format!(
                    "Use a different compiler or a {}{} (set CC and CXX).",
                    plan.compiler.family, bound
                ),
            };
            error!("{}", err);
            return Err(err);
        }

        let search_path = plan.env.get_path_string().unwrap_or_default();
        for requirement in &plan.requirements {
            let found = requirement
                .executables()
                .into_iter()
                .find_map(|exe| which::which_in(exe, Some(search_path), Path::new("/")).ok());
            match found {
                Some(path) => debug!(
                    "Requirement '{}' satisfied by {}",
                    requirement.name,
                    path.display()
                ),
                None if requirement.fatal => {
                    let err = HopsError::UnsatisfiedRequirement {
                        formula: plan.formula.clone(),
                        requirement: requirement.name.clone(),
                        hint: requirement.hint(),
                    };
                    error!("{}", err);
                    return Err(err);
                }
                None => warn!(
                    "{}: optional requirement '{}' not found ({})",
                    plan.formula,
                    requirement.name,
                    requirement.hint()
                ),
            }
        }
        Ok(())
    }

    /// Recreates the build root and puts sources, resources and patches in place.
    pub async fn stage(&self, plan: &BuildPlan) -> Result<()> {
        let layout = &plan.layout;
        hops_aio::fs::remove_path(&layout.build_root)?;
        for dir in [
            &layout.buildpath,
            &layout.staging,
            &layout.patches_dir,
            &layout.resources_dir,
            &layout.tmp_dir,
        ] {
            fs::create_dir_all(dir)?;
        }

        info!("==> Fetching {}", plan.source.url);
        let archive = self.fetcher.fetch(&plan.source).await?;
        if ArchiveKind::detect(&archive).is_some() {
            let strip = match infer_archive_root_dir(&archive)? {
                Some(root) => {
                    debug!("Stripping top-level directory {}", root.display());
                    1
                }
                None => 0,
            };
            info!("==> Extracting {} to {}", archive.display(), layout.buildpath.display());
            extract_archive_async(&archive, &layout.buildpath, strip).await?;
        } else {
            let dest = layout.buildpath.join(&plan.source.file_name);
            debug!("Source is not an archive; copying to {}", dest.display());
            fs::copy(&archive, dest)?;
        }

        for resource in &plan.resources {
            let fetched = self.fetcher.fetch(&resource.request).await?;
            if let Some(parent) = resource.dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&fetched, &resource.dest)?;
            debug!("Staged resource '{}' at {}", resource.name, resource.dest.display());
        }

        for patch in &plan.patches {
            match &patch.source {
                PatchSource::Inline(data) => fs::write(&patch.path, data)?,
                PatchSource::Remote(request) => {
                    let fetched = self.fetcher.fetch(request).await?;
                    fs::copy(&fetched, &patch.path)?;
                }
            }
        }
        Ok(())
    }

    pub async fn run_steps(&self, plan: &BuildPlan) -> Result<BuildReport> {
        let count = plan.steps.len();
        let mut report = BuildReport {
            formula: plan.formula.clone(),
            staging: plan.layout.staging.clone(),
            steps: Vec::with_capacity(count),
            warnings: Vec::new(),
        };
        if let Some(dir) = &self.log_dir {
            fs::create_dir_all(dir)?;
        }

        for (i, step) in plan.steps.iter().enumerate() {
            let number = i + 1;
            info!("==> [{}/{}] {}: {}", number, count, step.name, step.command.display_line());
            let started = Instant::now();
            let outcome = match self.runner.run(&step.command).await {
                Ok(outcome) => outcome,
                Err(e) => CommandOutcome {
                    exit_code: None,
                    timed_out: false,
                    output: e.to_string(),
                },
            };
            let log_path = self.write_log(number, step, &outcome);
            let record = StepRecord {
                name: step.name.clone(),
                exit_code: outcome.exit_code,
                success: outcome.success(),
                duration: started.elapsed(),
                log_path,
            };
            report.steps.push(record);

            if outcome.success() {
                continue;
            }
            let failure = StepFailure {
                formula: plan.formula.clone(),
                step_number: number,
                step_count: count,
                step_name: step.name.clone(),
                command_line: step.command.display_line(),
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
                output_tail: output_tail(&outcome.output, OUTPUT_TAIL_LINES),
            };
            if step.best_effort {
                warn!("Best-effort step failed, continuing: {}", failure);
                report.warnings.push(failure.to_string());
                continue;
            }
            error!("Build of {} failed at step {}/{}", plan.formula, number, count);
            return Err(failure.into());
        }
        Ok(report)
    }

    fn write_log(
        &self,
        number: usize,
        step: &PlannedStep,
        outcome: &CommandOutcome,
    ) -> Option<PathBuf> {
        let dir = self.log_dir.as_ref()?;
        let safe_name: String = step
            .name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{number:02}.{safe_name}.log"));
        let contents = format!(
            "{}\n\n{}\nexit_code: {:?} timed_out: {}\n",
            step.command.display_line(),
            outcome.output,
            outcome.exit_code,
            outcome.timed_out
        );
        match fs::write(&path, contents) {
            Ok(()) => Some(path),
            Err(e) => {
                warn!("Could not write step log {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use hops_aio::{CommandSpec, SystemRunner};
    use hops_common::fetch::FetchRequest;
    use hops_common::model::formula::Phase;
    use hops_common::model::platform::{Compiler, CompilerFamily, ToolVersion};
    use hops_common::model::Formula;

    use super::*;
    use crate::build::env::BuildEnvironment;
    use crate::build::plan::BuildLayout;

    /// Records every command and fails the ones whose program is listed.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<CommandSpec>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
            self.calls.lock().unwrap().push(spec.clone());
            let fail = self.failing.contains(&spec.program);
            Ok(CommandOutcome {
                exit_code: Some(if fail { 2 } else { 0 }),
                timed_out: false,
                output: format!("ran {}\n", spec.program),
            })
        }
    }

    struct NoFetch;

    #[async_trait]
    impl Fetcher for NoFetch {
        async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf> {
            Err(HopsError::FetchFailure {
                name: request.name.clone(),
                url: request.url.clone(),
                reason: "offline".into(),
            })
        }
    }

    fn step(name: &str, program: &str, best_effort: bool) -> PlannedStep {
        PlannedStep {
            name: name.to_string(),
            phase: Phase::Build,
            command: CommandSpec::new(program),
            best_effort,
        }
    }

    fn plan(steps: Vec<PlannedStep>, compiler: Compiler) -> BuildPlan {
        let formula = Formula::from_json_str(
            r#"{"name": "madlib", "version": "1.8",
                "source": {"url": "https://github.com/madlib/madlib/archive/v1.8.tar.gz",
                           "sha256": "15d8ee925866f477f4fb62964a1ea6a15796e9c7db676d786928495249078df3"},
                "fails_with": [{"compiler": "clang", "build": "503", "cause": "See http://jira.madlib.net/browse/MADLIB-865"}],
                "requirements": [{"name": "definitely-not-installed-tool", "fatal": false}]}"#,
        )
        .unwrap();
        BuildPlan {
            formula: formula.name.clone(),
            version: formula.version.clone(),
            source: FetchRequest::from_source("madlib", &formula.source),
            resources: Vec::new(),
            patches: Vec::new(),
            steps,
            env: BuildEnvironment::default(),
            layout: BuildLayout::new("/nonexistent/build", "/k", "/o", "/h"),
            requirements: formula.requirements.clone(),
            fails_with: formula.fails_with.clone(),
            compiler,
        }
    }

    fn compiler(family: CompilerFamily, version: &str) -> Compiler {
        Compiler {
            family,
            version: ToolVersion::parse(version).unwrap(),
        }
    }

    #[tokio::test]
    async fn failing_step_stops_the_build() {
        let runner = Arc::new(RecordingRunner {
            failing: vec!["three".into()],
            ..Default::default()
        });
        let executor = BuildExecutor::new(runner.clone(), Arc::new(NoFetch));
        let steps = ["one", "two", "three", "four", "five"]
            .iter()
            .map(|p| step(p, p, false))
            .collect();
        let plan = plan(steps, compiler(CompilerFamily::Clang, "700"));

        let err = executor.run_steps(&plan).await.unwrap_err();
        match err {
            HopsError::StepFailure(failure) => {
                assert_eq!(failure.step_number, 3);
                assert_eq!(failure.step_count, 5);
                assert_eq!(failure.step_name, "three");
                assert_eq!(failure.exit_code, Some(2));
                assert_eq!(failure.output_tail, vec!["ran three"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let programs: Vec<String> = runner
            .calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect();
        assert_eq!(programs, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn best_effort_failures_continue() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner {
            failing: vec!["check".into()],
            ..Default::default()
        });
        let executor =
            BuildExecutor::new(runner.clone(), Arc::new(NoFetch)).with_log_dir(tmp.path());
        let plan = plan(
            vec![
                step("make", "make", false),
                step("make check", "check", true),
                step("install", "install", false),
            ],
            compiler(CompilerFamily::Gcc, "12.2.0"),
        );
        let report = executor.run_steps(&plan).await.unwrap();
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.warnings.len(), 1);
        assert!(!report.steps[1].success);
        assert!(tmp.path().join("02.make_check.log").is_file());
    }

    #[tokio::test]
    async fn incompatible_toolchain_runs_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = BuildExecutor::new(runner.clone(), Arc::new(NoFetch));
        let plan = plan(vec![step("cmake", "cmake", false)], compiler(CompilerFamily::Clang, "425"));

        let err = executor.execute(&plan).await.unwrap_err();
        match &err {
            HopsError::IncompatibleToolchain {
                compiler,
                version,
                cause,
                ..
            } => {
                assert_eq!(compiler, "clang");
                assert_eq!(version, "425");
                assert!(cause.as_deref().unwrap().contains("MADLIB-865"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_fatal_requirement_is_reported() {
        let runner = Arc::new(RecordingRunner::default());
        let executor = BuildExecutor::new(runner.clone(), Arc::new(NoFetch));
        let mut plan = plan(vec![step("make", "make", false)], compiler(CompilerFamily::Gcc, "12"));
        plan.requirements[0].fatal = true;

        let err = executor.execute(&plan).await.unwrap_err();
        assert!(matches!(err, HopsError::UnsatisfiedRequirement { .. }));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failures_surface_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let runner = Arc::new(RecordingRunner::default());
        let executor = BuildExecutor::new(runner.clone(), Arc::new(NoFetch));
        let mut plan = plan(vec![step("make", "make", false)], compiler(CompilerFamily::Gcc, "12"));
        plan.layout = BuildLayout::new(tmp.path().join("build"), "/k", "/o", "/h");

        let err = executor.execute(&plan).await.unwrap_err();
        assert!(matches!(err, HopsError::FetchFailure { ref reason, .. } if reason == "offline"));
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn real_timeouts_are_step_failures() {
        let executor = BuildExecutor::new(Arc::new(SystemRunner), Arc::new(NoFetch));
        let mut sleepy = step("sleep", "/bin/sh", false);
        sleepy.command = CommandSpec::new("/bin/sh")
            .args(["-c", "sleep 5"])
            .envs(BTreeMap::new())
            .timeout(Some(Duration::from_millis(200)));
        let plan = plan(vec![sleepy], compiler(CompilerFamily::Gcc, "12"));

        let err = executor.run_steps(&plan).await.unwrap_err();
        match err {
            HopsError::StepFailure(failure) => assert!(failure.timed_out),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
