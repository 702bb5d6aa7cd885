// hops-aio/src/process.rs
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hops_common::error::{HopsError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, error, warn};

/// A fully rendered command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Start from an empty environment instead of inheriting ours.
    pub clear_env: bool,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs(mut self, vars: BTreeMap<String, String>) -> Self {
        self.env.extend(vars);
        self
    }

    pub fn clear_env(mut self) -> Self {
        self.clear_env = true;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| {
                if part.is_empty()
                    || part.contains(|c: char| c.is_whitespace() || "'\"$`\\".contains(c))
                {
                    format!("'{}'", part.replace('\'', r"'\''"))
                } else {
                    part.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if self.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&self.env);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Result of running a command to completion (or to its timeout).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// `None` when the process was killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Captured stdout followed by stderr.
    pub output: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Seam for running external commands; tests substitute recording runners.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `spec` to completion. Only a failure to start the process is an
    /// error; non-zero exits and timeouts are reported in the outcome.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

/// Grace period for pipe readers after the child has been killed.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

async fn read_all<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf).await {
        debug!("Error reading child output: {}", e);
    }
    buf
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutcome> {
        debug!(
            "Running: {} (cwd: {:?}, env keys: {:?})",
            spec.display_line(),
            spec.cwd,
            spec.env.keys().collect::<Vec<_>>()
        );

        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn '{}': {}", spec.program, e);
            HopsError::CommandExecError(format!("{}: {}", spec.display_line(), e))
        })?;
        let pid = child.id();

        let stdout = child.stdout.take().map(|s| tokio::spawn(read_all(s)));
        let stderr = child.stderr.take().map(|s| tokio::spawn(read_all(s)));

        let (status, timed_out) = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => (Some(status?), false),
                Err(_) => {
                    warn!(
                        "'{}' exceeded its timeout of {:?}; killing it",
                        spec.display_line(),
                        limit
                    );
                    if let Some(pid) = pid {
                        kill_group(pid, libc::SIGKILL);
                    }
                    let _ = child.kill().await;
                    (None, true)
                }
            },
            None => (Some(child.wait().await?), false),
        };

        let mut output = String::new();
        for reader in [stdout, stderr].into_iter().flatten() {
            match tokio::time::timeout(DRAIN_TIMEOUT, reader).await {
                Ok(Ok(bytes)) => output.push_str(&String::from_utf8_lossy(&bytes)),
                Ok(Err(e)) => debug!("Output reader task failed: {}", e),
                Err(_) => debug!("Output still open after child exit; truncating"),
            }
        }

        let exit_code = status.and_then(|s| s.code());
        debug!(
            "'{}' finished: exit_code={:?}, timed_out={}",
            spec.program, exit_code, timed_out
        );
        Ok(CommandOutcome {
            exit_code,
            timed_out,
            output,
        })
    }
}

#[cfg(unix)]
fn kill_group(pid: u32, signal: libc::c_int) {
    // SAFETY: plain syscall; a stale pid at worst yields ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, signal);
    }
}

/// A long-running child started in its own process group. Dropping it kills
/// the whole group.
#[derive(Debug)]
pub struct BackgroundProcess {
    name: String,
    child: std::process::Child,
}

impl BackgroundProcess {
    /// Starts `spec` with stdout and stderr going to `log` (or nowhere).
    pub fn spawn(name: impl Into<String>, spec: &CommandSpec, log: Option<&Path>) -> Result<Self> {
        let name = name.into();
        let mut cmd = std::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        if spec.clear_env {
            cmd.env_clear();
        }
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        let (out, err) = match log {
            Some(path) => {
                let file = File::create(path)?;
                (Stdio::from(file.try_clone()?), Stdio::from(file))
            }
            None => (Stdio::null(), Stdio::null()),
        };
        cmd.stdin(Stdio::null()).stdout(out).stderr(err);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            HopsError::CommandExecError(format!("{}: {}", spec.display_line(), e))
        })?;
        debug!("Started background process '{}' (pid {})", name, child.id());
        Ok(Self { name, child })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// SIGTERM to the group, then SIGKILL once `grace` has passed.
    pub fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }
        debug!("Stopping background process '{}' (pid {})", self.name, self.pid());
        kill_group(self.pid(), libc::SIGTERM);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.child.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        warn!("'{}' ignored SIGTERM; killing it", self.name);
        kill_group(self.pid(), libc::SIGKILL);
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for BackgroundProcess {
    fn drop(&mut self) {
        if self.is_running() {
            kill_group(self.pid(), libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}
