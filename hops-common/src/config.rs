// hops-common/src/config.rs
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::UserDirs;
use tracing::debug;

use super::error::{HopsError, Result};

// Fallback if HOPS_PREFIX is not set or is empty.
const DEFAULT_HOPS_ROOT: &str = "/opt/hops";
const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Config {
    pub hops_root: PathBuf,
    /// Directories searched for `<name>.json` formulas, in order.
    pub formula_dirs: Vec<PathBuf>,
    pub make_jobs: usize,
    pub step_timeout: Duration,
    pub test_timeout: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        debug!("Loading hops configuration");

        let root_str = env::var("HOPS_PREFIX")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                debug!(
                    "HOPS_PREFIX not set or empty, falling back to default: {}",
                    DEFAULT_HOPS_ROOT
                );
                DEFAULT_HOPS_ROOT.to_string()
            });
        let hops_root = PathBuf::from(&root_str);
        debug!("Effective HOPS_PREFIX set to: {}", hops_root.display());

        let formula_dirs = match env::var("HOPS_FORMULA_PATH") {
            Ok(value) if !value.is_empty() => env::split_paths(&value).collect(),
            _ => vec![hops_root.join("Formula")],
        };

        let make_jobs = match env::var("HOPS_MAKE_JOBS") {
            Ok(value) if !value.is_empty() => value
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    HopsError::Config(format!("HOPS_MAKE_JOBS must be a positive integer, got '{value}'"))
                })?,
            _ => num_cpus::get(),
        };

        let step_timeout = duration_from_env("HOPS_STEP_TIMEOUT", DEFAULT_STEP_TIMEOUT)?;
        let test_timeout = duration_from_env("HOPS_TEST_TIMEOUT", DEFAULT_TEST_TIMEOUT)?;

        debug!("Configuration loaded successfully.");
        Ok(Self {
            hops_root,
            formula_dirs,
            make_jobs,
            step_timeout,
            test_timeout,
        })
    }

    /// Configuration rooted at `root` with defaults for everything else.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let hops_root = root.into();
        Self {
            formula_dirs: vec![hops_root.join("Formula")],
            hops_root,
            make_jobs: num_cpus::get(),
            step_timeout: DEFAULT_STEP_TIMEOUT,
            test_timeout: DEFAULT_TEST_TIMEOUT,
        }
    }

    pub fn hops_root(&self) -> &Path {
        &self.hops_root
    }

    pub fn cellar_dir(&self) -> PathBuf {
        self.hops_root.join("Cellar")
    }

    pub fn opt_dir(&self) -> PathBuf {
        self.hops_root.join("opt")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.hops_root.join("hops_cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.hops_root.join("hops_logs")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.hops_root.join("tmp")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.var_dir().join("locks")
    }

    pub fn var_dir(&self) -> PathBuf {
        self.hops_root.join("var")
    }

    pub fn formula_cellar_dir(&self, formula_name: &str) -> PathBuf {
        self.cellar_dir().join(formula_name)
    }

    pub fn formula_keg_path(&self, formula_name: &str, version_str: &str) -> PathBuf {
        self.formula_cellar_dir(formula_name).join(version_str)
    }

    pub fn formula_opt_path(&self, formula_name: &str) -> PathBuf {
        self.opt_dir().join(formula_name)
    }

    pub fn formula_logs_dir(&self, formula_name: &str) -> PathBuf {
        self.logs_dir().join(formula_name)
    }

    /// Home directory of the invoking user, for environments that lack `HOME`.
    pub fn home_dir(&self) -> PathBuf {
        UserDirs::new().map_or_else(|| PathBuf::from("/"), |ud| ud.home_dir().to_path_buf())
    }
}

/// Reads a duration such as `90s` or `2h` from the environment.
fn duration_from_env(var: &str, default: Duration) -> Result<Duration> {
    match env::var(var) {
        Ok(value) if !value.is_empty() => humantime::parse_duration(&value)
            .map_err(|e| HopsError::Config(format!("{var}='{value}' is not a duration: {e}"))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn defaults_without_environment() {
        temp_env::with_vars_unset(
            [
                "HOPS_PREFIX",
                "HOPS_FORMULA_PATH",
                "HOPS_MAKE_JOBS",
                "HOPS_STEP_TIMEOUT",
                "HOPS_TEST_TIMEOUT",
            ],
            || {
                let config = Config::load().unwrap();
                assert_eq!(config.hops_root(), Path::new(DEFAULT_HOPS_ROOT));
                assert_eq!(config.formula_dirs, vec![PathBuf::from("/opt/hops/Formula")]);
                assert_eq!(config.step_timeout, DEFAULT_STEP_TIMEOUT);
                assert!(config.make_jobs >= 1);
            },
        );
    }

    #[test]
    #[serial]
    fn reads_overrides_from_environment() {
        temp_env::with_vars(
            [
                ("HOPS_PREFIX", Some("/tmp/hops-root")),
                ("HOPS_FORMULA_PATH", Some("/a/formulas:/b/formulas")),
                ("HOPS_MAKE_JOBS", Some("3")),
                ("HOPS_STEP_TIMEOUT", Some("90s")),
                ("HOPS_TEST_TIMEOUT", None),
            ],
            || {
                let config = Config::load().unwrap();
                assert_eq!(
                    config.formula_keg_path("r", "3.2.2"),
                    PathBuf::from("/tmp/hops-root/Cellar/r/3.2.2")
                );
                assert_eq!(config.formula_dirs.len(), 2);
                assert_eq!(config.make_jobs, 3);
                assert_eq!(config.step_timeout, Duration::from_secs(90));
                assert_eq!(config.test_timeout, DEFAULT_TEST_TIMEOUT);
            },
        );
    }

    #[test]
    #[serial]
    fn rejects_invalid_job_count() {
        temp_env::with_var("HOPS_MAKE_JOBS", Some("zero"), || {
            assert!(matches!(Config::load(), Err(HopsError::Config(_))));
        });
    }
}
