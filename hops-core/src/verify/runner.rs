// hops-core/src/verify/runner.rs
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hops_aio::{BackgroundProcess, CommandRunner, CommandSpec};
use hops_common::error::{output_tail, HopsError, Result, VerificationFailure, OUTPUT_TAIL_LINES};
use hops_common::model::platform::Platform;
use hops_common::model::verify::{CommandTemplate, Probe, ServiceSpec, ServiceStart, VerifyAction};
use hops_common::model::Formula;
use hops_common::template::TemplateVars;
use tracing::{debug, error, info, warn};

use super::scope::{ServiceHandle, ServiceScope};
use crate::build::env::DependencyPrefix;
use crate::build::plan::{insert_dependency_vars, install_vars};
use crate::install::InstallationLayout;

/// Stop commands run during teardown, after the overall deadline may have passed.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

pub struct VerificationRequest<'a> {
    pub formula: &'a Formula,
    pub platform: &'a Platform,
    pub layout: &'a InstallationLayout,
    pub hops_prefix: &'a Path,
    pub dependencies: &'a [DependencyPrefix],
    pub base_env: &'a BTreeMap<String, String>,
    /// Limit for the whole procedure, services included.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub formula: String,
    pub actions_run: usize,
    /// Services this run started (and stopped again).
    pub services_started: Vec<String>,
    /// Services found already running; left untouched.
    pub services_reused: Vec<String>,
    pub duration: Duration,
}

/// Runs a formula's smoke test against its installed keg.
pub struct VerificationRunner {
    runner: Arc<dyn CommandRunner>,
}

struct RunContext<'a> {
    formula: &'a str,
    actions: &'a [VerifyAction],
    vars: TemplateVars,
    env: BTreeMap<String, String>,
    testpath: PathBuf,
    deadline: Instant,
}

impl RunContext<'_> {
    fn command(&self, template: &CommandTemplate) -> Result<CommandSpec> {
        let mut env = self.env.clone();
        for (key, value) in &template.env {
            env.insert(key.clone(), self.vars.render(value)?);
        }
        Ok(CommandSpec::new(self.vars.render(&template.command)?)
            .args(self.vars.render_all(&template.args)?)
            .cwd(&self.testpath)
            .envs(env)
            .clear_env()
            .timeout(Some(self.remaining())))
    }

    fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    fn auxiliary(&self, service: &str, reason: impl Into<String>) -> HopsError {
        VerificationFailure::Auxiliary {
            formula: self.formula.to_string(),
            service: service.to_string(),
            reason: reason.into(),
        }
        .into()
    }
}

impl VerificationRunner {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    pub async fn run(&self, request: &VerificationRequest<'_>) -> Result<VerificationReport> {
        let formula = request.formula;
        let started = Instant::now();
        let mut report = VerificationReport {
            formula: formula.name().to_string(),
            ..Default::default()
        };
        if formula.test.is_empty() {
            debug!("{} declares no verification actions", formula.name());
            return Ok(report);
        }
        info!("==> Testing {}", formula.name());

        let testdir = tempfile::Builder::new()
            .prefix(&format!("hops-test-{}-", formula.name()))
            .tempdir()?;
        let ctx = self.context(request, testdir.path().to_path_buf(), started);

        let mut scope = ServiceScope::default();
        let outcome = tokio::time::timeout(
            request.timeout,
            self.run_actions(&ctx, &mut scope, &mut report),
        )
        .await;
        let current = scope.current_action;
        report.services_started = scope.names();
        let failures = scope.teardown(self.runner.as_ref()).await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(VerificationFailure::Exercise {
                formula: formula.name().to_string(),
                action_number: current,
                command_line: format!("verification of {}", formula.name()),
                exit_code: None,
                timed_out: true,
                output_tail: vec![format!("exceeded {:?}", request.timeout)],
            }
            .into()),
        };

        match result {
            Err(err) => {
                for (service, reason) in failures {
                    warn!("Failed to stop service '{}': {}", service, reason);
                }
                error!("{}", err);
                Err(err)
            }
            Ok(()) => {
                if let Some((service, reason)) = failures.into_iter().next() {
                    let err = ctx.auxiliary(&service, format!("failed to stop: {reason}"));
                    error!("{}", err);
                    return Err(err);
                }
                report.duration = started.elapsed();
                info!(
                    "==> {} passed {} checks in {:?}",
                    formula.name(),
                    report.actions_run,
                    report.duration
                );
                Ok(report)
            }
        }
    }

    fn context<'a>(
        &self,
        request: &VerificationRequest<'a>,
        testpath: PathBuf,
        started: Instant,
    ) -> RunContext<'a> {
        let layout = request.layout;
        let mut env = request.base_env.clone();
        let mut path_dirs = vec![layout.keg.join("bin"), layout.keg.join("sbin")];
        path_dirs.extend(request.dependencies.iter().map(|d| d.opt.join("bin")));
        let mut path = path_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        if let Some(base) = request.base_env.get("PATH").filter(|p| !p.is_empty()) {
            path.push(':');
            path.push_str(base);
        }
        env.insert("PATH".to_string(), path);
        env.insert("HOME".to_string(), testpath.display().to_string());

        let mut vars = install_vars(
            request.formula,
            &layout.keg,
            &layout.opt,
            request.hops_prefix,
            request.platform,
        );
        vars.insert("testpath", testpath.display().to_string());
        insert_dependency_vars(&mut vars, request.dependencies);
        RunContext {
            formula: request.formula.name(),
            actions: &request.formula.test.actions,
            vars: vars.with_env(env.clone()),
            env,
            testpath,
            deadline: started + request.timeout,
        }
    }

    async fn run_actions(
        &self,
        ctx: &RunContext<'_>,
        scope: &mut ServiceScope,
        report: &mut VerificationReport,
    ) -> Result<()> {
        for (i, action) in ctx.actions.iter().enumerate() {
            let number = i + 1;
            scope.current_action = number;
            match action {
                VerifyAction::Run {
                    command,
                    args,
                    env,
                    expect_exit,
                    expect_output,
                    cwd,
                } => {
                    let template = CommandTemplate {
                        command: command.clone(),
                        args: args.clone(),
                        env: env.clone(),
                    };
                    let mut spec = ctx.command(&template)?;
                    if let Some(dir) = cwd {
                        spec = spec.cwd(ctx.testpath.join(ctx.vars.render(dir)?));
                    }
                    self.exercise(ctx, number, &spec, *expect_exit, expect_output.as_deref())
                        .await?;
                }
                VerifyAction::Service(service) => {
                    self.bring_up(ctx, service, scope, report).await?;
                }
            }
            report.actions_run = number;
        }
        Ok(())
    }

    async fn exercise(
        &self,
        ctx: &RunContext<'_>,
        number: usize,
        spec: &CommandSpec,
        expect_exit: i32,
        expect_output: Option<&str>,
    ) -> Result<()> {
        info!("==> [test {}] {}", number, spec.display_line());
        let failure = |exit_code, timed_out, output: &str| -> HopsError {
            VerificationFailure::Exercise {
                formula: ctx.formula.to_string(),
                action_number: number,
                command_line: spec.display_line(),
                exit_code,
                timed_out,
                output_tail: output_tail(output, OUTPUT_TAIL_LINES),
            }
            .into()
        };
        let outcome = match self.runner.run(spec).await {
            Ok(outcome) => outcome,
            Err(e) => return Err(failure(None, false, &e.to_string())),
        };
        if outcome.timed_out || outcome.exit_code != Some(expect_exit) {
            return Err(failure(outcome.exit_code, outcome.timed_out, &outcome.output));
        }
        if let Some(expected) = expect_output {
            let expected = ctx.vars.render(expected)?;
            if !outcome.output.contains(&expected) {
                let mut output = outcome.output.clone();
                output.push_str(&format!("\n(expected output containing '{expected}')"));
                return Err(failure(outcome.exit_code, false, &output));
            }
        }
        Ok(())
    }

    async fn bring_up(
        &self,
        ctx: &RunContext<'_>,
        service: &ServiceSpec,
        scope: &mut ServiceScope,
        report: &mut VerificationReport,
    ) -> Result<()> {
        if let Some(probe) = &service.detect {
            if self.probe(ctx, probe, None).await? {
                info!("Service '{}' is already running; using it as is", service.name);
                report.services_reused.push(service.name.clone());
                return Ok(());
            }
        }

        info!("==> Starting service '{}'", service.name);
        match &service.start {
            ServiceStart::Spawn(template) => {
                let spec = ctx.command(template)?.timeout(None);
                let log = ctx.testpath.join(format!("{}.log", service.name));
                let process = BackgroundProcess::spawn(&service.name, &spec, Some(&log))
                    .map_err(|e| ctx.auxiliary(&service.name, e.to_string()))?;
                scope.register(ServiceHandle::Owned(process));
            }
            ServiceStart::Managed { start, stop } => {
                // Registered up front so a run cancelled mid-start still stops it.
                scope.register(ServiceHandle::Managed {
                    name: service.name.clone(),
                    stop: ctx.command(stop)?.timeout(Some(STOP_TIMEOUT)),
                });
                let spec = ctx.command(start)?;
                let outcome = match self.runner.run(&spec).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        scope.forget(&service.name);
                        return Err(ctx.auxiliary(&service.name, e.to_string()));
                    }
                };
                if !outcome.success() {
                    // A start that exited on its own started nothing of ours.
                    if !outcome.timed_out {
                        scope.forget(&service.name);
                    }
                    return Err(ctx.auxiliary(
                        &service.name,
                        format!(
                            "'{}' exited with {:?}: {}",
                            spec.display_line(),
                            outcome.exit_code,
                            output_tail(&outcome.output, 5).join(" | ")
                        ),
                    ));
                }
            }
        }
        self.await_ready(ctx, service, scope).await
    }

    async fn await_ready(
        &self,
        ctx: &RunContext<'_>,
        service: &ServiceSpec,
        scope: &mut ServiceScope,
    ) -> Result<()> {
        let readiness = &service.readiness;
        if let Some(delay) = readiness.delay_ms {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let Some(probe) = &readiness.probe else {
            return Ok(());
        };
        let limit = Duration::from_millis(readiness.timeout_ms);
        let interval = Duration::from_millis(readiness.interval_ms.max(10));
        let started = Instant::now();
        loop {
            let budget = limit.saturating_sub(started.elapsed());
            if self.probe(ctx, probe, Some(budget)).await? {
                debug!("Service '{}' ready after {:?}", service.name, started.elapsed());
                return Ok(());
            }
            if let Some(ServiceHandle::Owned(process)) = scope.get_mut(&service.name) {
                if !process.is_running() {
                    return Err(ctx.auxiliary(&service.name, "exited before becoming ready"));
                }
            }
            if started.elapsed() >= limit {
                return Err(ctx.auxiliary(&service.name, format!("not ready after {limit:?}")));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Whether `probe` passes. A command probe runs for at most `limit`,
    /// and never past the overall deadline.
    async fn probe(
        &self,
        ctx: &RunContext<'_>,
        probe: &Probe,
        limit: Option<Duration>,
    ) -> Result<bool> {
        match probe {
            Probe::PathExists(template) => Ok(Path::new(&ctx.vars.render(template)?).exists()),
            Probe::Command(template) => {
                let mut spec = ctx.command(template)?;
                if let Some(limit) = limit {
                    spec = spec.timeout(Some(limit.min(ctx.remaining())));
                }
                Ok(self
                    .runner
                    .run(&spec)
                    .await
                    .map(|o| o.success())
                    .unwrap_or(false))
            }
        }
    }
}
