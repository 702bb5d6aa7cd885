use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Number of trailing output lines kept on step and verification failures.
pub const OUTPUT_TAIL_LINES: usize = 50;

#[derive(Error, Debug, Clone)]
pub enum HopsError {
    #[error("I/O Error: {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("HTTP Request Error: {0}")]
    Http(#[from] Arc<reqwest::Error>),

    #[error("JSON Parsing Error: {0}")]
    Json(#[from] Arc<serde_json::Error>),

    #[error("Semantic Versioning Error: {0}")]
    SemVer(#[from] Arc<semver::Error>),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Malformed formula '{name}': {reason}")]
    MalformedFormula { name: String, reason: String },

    #[error("Invalid option for '{formula}': {reason}")]
    InvalidOption { formula: String, reason: String },

    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error(
        "{formula} cannot be built with {compiler} {version}{}. {hint}",
        .cause.as_ref().map(|c| format!(" ({c})")).unwrap_or_default()
    )]
    IncompatibleToolchain {
        formula: String,
        compiler: String,
        version: String,
        cause: Option<String>,
        hint: String,
    },

    #[error("Unsatisfied requirement '{requirement}' for {formula}: {hint}")]
    UnsatisfiedRequirement {
        formula: String,
        requirement: String,
        hint: String,
    },

    #[error("{0}")]
    StepFailure(Box<StepFailure>),

    #[error("Failed to fetch '{name}' from '{url}': {reason}")]
    FetchFailure {
        name: String,
        url: String,
        reason: String,
    },

    #[error("Checksum Mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Verification failed: {0}")]
    VerificationFailure(Box<VerificationFailure>),

    #[error("Build of {key} is already in progress{}", .holder.as_ref().map(|h| format!(" ({h})")).unwrap_or_default())]
    LockContention { key: String, holder: Option<String> },

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Installation Error: {0}")]
    InstallError(String),

    #[error("Build environment setup failed: {0}")]
    BuildEnvError(String),

    #[error("Failed to execute command: {0}")]
    CommandExecError(String),

    #[error("Generic Error: {0}")]
    Generic(String),
}

impl HopsError {
    pub fn malformed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedFormula {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for HopsError {
    fn from(err: std::io::Error) -> Self {
        HopsError::Io(Arc::new(err))
    }
}

impl From<reqwest::Error> for HopsError {
    fn from(err: reqwest::Error) -> Self {
        HopsError::Http(Arc::new(err))
    }
}

impl From<serde_json::Error> for HopsError {
    fn from(err: serde_json::Error) -> Self {
        HopsError::Json(Arc::new(err))
    }
}

impl From<semver::Error> for HopsError {
    fn from(err: semver::Error) -> Self {
        HopsError::SemVer(Arc::new(err))
    }
}

impl From<StepFailure> for HopsError {
    fn from(failure: StepFailure) -> Self {
        HopsError::StepFailure(Box::new(failure))
    }
}

impl From<VerificationFailure> for HopsError {
    fn from(failure: VerificationFailure) -> Self {
        HopsError::VerificationFailure(Box::new(failure))
    }
}

pub type Result<T> = std::result::Result<T, HopsError>;

/// A build step that exited non-zero, timed out or could not be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFailure {
    pub formula: String,
    /// 1-based position of the failing step.
    pub step_number: usize,
    pub step_count: usize,
    pub step_name: String,
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output_tail: Vec<String>,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: step {}/{} '{}' ",
            self.formula, self.step_number, self.step_count, self.step_name
        )?;
        match (self.timed_out, self.exit_code) {
            (true, _) => write!(f, "timed out")?,
            (false, Some(code)) => write!(f, "exited with status {code}")?,
            (false, None) => write!(f, "terminated abnormally")?,
        }
        write!(f, "\n  command: {}", self.command_line)?;
        if !self.output_tail.is_empty() {
            write!(f, "\n  last {} lines of output:", self.output_tail.len())?;
            for line in &self.output_tail {
                write!(f, "\n    {line}")?;
            }
        }
        Ok(())
    }
}

/// Failure of a verification procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    /// The installed software could not be exercised.
    Exercise {
        formula: String,
        action_number: usize,
        command_line: String,
        exit_code: Option<i32>,
        timed_out: bool,
        output_tail: Vec<String>,
    },
    /// An auxiliary service failed to start, become ready or stop.
    Auxiliary {
        formula: String,
        service: String,
        reason: String,
    },
}

impl VerificationFailure {
    pub fn is_auxiliary(&self) -> bool {
        matches!(self, Self::Auxiliary { .. })
    }
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exercise {
                formula,
                action_number,
                command_line,
                exit_code,
                timed_out,
                output_tail,
            } => {
                write!(f, "{formula}: test action {action_number} ")?;
                if *timed_out {
                    write!(f, "timed out")?;
                } else {
                    match exit_code {
                        Some(code) => write!(f, "exited with status {code}")?,
                        None => write!(f, "could not be run")?,
                    }
                }
                write!(f, "\n  command: {command_line}")?;
                for line in output_tail {
                    write!(f, "\n    {line}")?;
                }
                Ok(())
            }
            Self::Auxiliary {
                formula,
                service,
                reason,
            } => write!(f, "{formula}: auxiliary service '{service}': {reason}"),
        }
    }
}

/// Keeps the last `max` lines of `output`.
pub fn output_tail(output: &str, max: usize) -> Vec<String> {
    let lines: Vec<&str> = output.lines().collect();
    let start = lines.len().saturating_sub(max);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_is_rendered_as_path() {
        let err = HopsError::CyclicDependency {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }

    #[test]
    fn step_failure_names_step_and_command() {
        let failure = StepFailure {
            formula: "r".into(),
            step_number: 3,
            step_count: 5,
            step_name: "make".into(),
            command_line: "make -j4".into(),
            exit_code: Some(2),
            timed_out: false,
            output_tail: vec!["error: boom".into()],
        };
        let rendered = HopsError::from(failure).to_string();
        assert!(rendered.contains("step 3/5 'make' exited with status 2"));
        assert!(rendered.contains("command: make -j4"));
        assert!(rendered.contains("error: boom"));
    }

    #[test]
    fn output_tail_keeps_last_lines() {
        let output = (1..=60).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = output_tail(&output, OUTPUT_TAIL_LINES);
        assert_eq!(tail.len(), 50);
        assert_eq!(tail.first().map(String::as_str), Some("11"));
        assert_eq!(tail.last().map(String::as_str), Some("60"));
    }
}
