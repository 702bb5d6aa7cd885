// hops-core/src/verify/scope.rs
//! Auxiliary services started during verification, torn down in reverse order.

use std::process::{Command, Stdio};
use std::time::Duration;

use hops_aio::{BackgroundProcess, CommandRunner, CommandSpec};
use tracing::{debug, warn};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub(crate) enum ServiceHandle {
    /// A child we spawned; stopping it means killing its process group.
    Owned(BackgroundProcess),
    /// Started through a start command; stopping it runs `stop`.
    Managed { name: String, stop: CommandSpec },
}

impl ServiceHandle {
    pub(crate) fn name(&self) -> &str {
        match self {
            Self::Owned(process) => process.name(),
            Self::Managed { name, .. } => name,
        }
    }
}

/// Every service started by a verification run.
///
/// [`ServiceScope::teardown`] stops them newest first. Anything still
/// registered when the scope is dropped (a cancelled or panicking run) is
/// stopped synchronously from `Drop`.
#[derive(Debug, Default)]
pub(crate) struct ServiceScope {
    services: Vec<ServiceHandle>,
    /// 1-based action currently in progress, for timeout reports.
    pub(crate) current_action: usize,
}

impl ServiceScope {
    pub(crate) fn register(&mut self, handle: ServiceHandle) {
        debug!("Registered service '{}'", handle.name());
        self.services.push(handle);
    }

    /// Drops the newest registration of `name` without stopping it.
    pub(crate) fn forget(&mut self, name: &str) -> Option<ServiceHandle> {
        let index = self.services.iter().rposition(|s| s.name() == name)?;
        debug!("Forgot service '{}'", name);
        Some(self.services.remove(index))
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ServiceHandle> {
        self.services.iter_mut().rev().find(|s| s.name() == name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name().to_string()).collect()
    }

    /// Stops every registered service, newest first. Returns the services
    /// that could not be stopped cleanly.
    pub(crate) async fn teardown(&mut self, runner: &dyn CommandRunner) -> Vec<(String, String)> {
        let mut failures = Vec::new();
        while let Some(handle) = self.services.pop() {
            match handle {
                ServiceHandle::Owned(process) => {
                    let name = process.name().to_string();
                    debug!("Stopping service '{}'", name);
                    let stopped = tokio::task::spawn_blocking(move || {
                        let mut process = process;
                        process.terminate(STOP_GRACE)
                    })
                    .await;
                    match stopped {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => failures.push((name, e.to_string())),
                        Err(e) => failures.push((name, format!("stop task failed: {e}"))),
                    }
                }
                ServiceHandle::Managed { name, stop } => {
                    debug!("Stopping service '{}': {}", name, stop.display_line());
                    match runner.run(&stop).await {
                        Ok(outcome) if outcome.success() => {}
                        Ok(outcome) => failures.push((
                            name,
                            format!(
                                "'{}' exited with {:?}: {}",
                                stop.display_line(),
                                outcome.exit_code,
                                outcome.output.trim()
                            ),
                        )),
                        Err(e) => failures.push((name, e.to_string())),
                    }
                }
            }
        }
        failures
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        while let Some(handle) = self.services.pop() {
            match handle {
                ServiceHandle::Owned(process) => {
                    warn!("Killing leftover service '{}'", process.name());
                    drop(process);
                }
                ServiceHandle::Managed { name, stop } => {
                    warn!("Stopping leftover service '{}'", name);
                    let mut cmd = Command::new(&stop.program);
                    cmd.args(&stop.args)
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::null());
                    if stop.clear_env {
                        cmd.env_clear();
                    }
                    cmd.envs(&stop.env);
                    if let Some(dir) = &stop.cwd {
                        cmd.current_dir(dir);
                    }
                    if let Err(e) = cmd.status() {
                        warn!("Failed to stop '{}': {}", name, e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use hops_aio::SystemRunner;

    use super::*;

    fn append(path: &std::path::Path, word: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").args([
            "-c".to_string(),
            format!("echo {word} >> '{}'", path.display()),
        ])
    }

    #[tokio::test]
    async fn teardown_runs_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("stops");
        let mut scope = ServiceScope::default();
        for name in ["first", "second", "third"] {
            scope.register(ServiceHandle::Managed {
                name: name.to_string(),
                stop: append(&log, name),
            });
        }
        let failures = scope.teardown(&SystemRunner).await;
        assert!(failures.is_empty());
        assert_eq!(fs::read_to_string(&log).unwrap(), "third\nsecond\nfirst\n");
        assert!(scope.names().is_empty());
    }

    #[test]
    fn dropping_the_scope_stops_managed_services() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("stops");
        {
            let mut scope = ServiceScope::default();
            scope.register(ServiceHandle::Managed {
                name: "db".to_string(),
                stop: append(&log, "db"),
            });
        }
        assert_eq!(fs::read_to_string(&log).unwrap(), "db\n");
    }
}
