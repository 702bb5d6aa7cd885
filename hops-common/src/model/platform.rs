// hops-common/src/model/platform.rs
//! Target platform description: operating system, architecture and compiler.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HopsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsFamily {
    Macos,
    Linux,
    Other,
}

impl OsFamily {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Macos
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Macos => "macos",
            Self::Linux => "linux",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X86_64,
    Aarch64,
    Other,
}

impl Arch {
    pub fn current() -> Self {
        match std::env::consts::ARCH {
            "x86_64" => Self::X86_64,
            "aarch64" => Self::Aarch64,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilerFamily {
    Clang,
    Gcc,
    /// The llvm-gcc hybrid shipped with old developer tools.
    Llvm,
    Unknown,
}

impl CompilerFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clang => "clang",
            Self::Gcc => "gcc",
            Self::Llvm => "llvm-gcc",
            Self::Unknown => "unknown",
        }
    }

    /// Default C and C++ driver names.
    pub fn drivers(&self) -> (&'static str, &'static str) {
        match self {
            Self::Clang => ("clang", "clang++"),
            Self::Gcc => ("gcc", "g++"),
            Self::Llvm => ("llvm-gcc", "llvm-g++"),
            Self::Unknown => ("cc", "c++"),
        }
    }
}

impl fmt::Display for CompilerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dotted tool version such as `"4.2.1"` or a bare build number like `"5666"`.
///
/// Short versions are padded to `major.minor.patch` and extra components are
/// dropped, so comparisons behave numerically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ToolVersion {
    raw: String,
    parsed: semver::Version,
}

impl ToolVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let numeric: Vec<u64> = trimmed
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse::<u64>().map_err(|_| {
                    HopsError::Generic(format!("Invalid tool version '{raw}'"))
                })
            })
            .collect::<Result<_>>()?;
        if numeric.len() > 3 {
            debug!("Tool version '{}' truncated to three components", raw);
        }
        let component = |i: usize| numeric.get(i).copied().unwrap_or(0);
        Ok(Self {
            raw: trimmed.to_string(),
            parsed: semver::Version::new(component(0), component(1), component(2)),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for ToolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for ToolVersion {}

impl std::hash::Hash for ToolVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
    }
}

impl Ord for ToolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl PartialOrd for ToolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ToolVersion {
    type Err = HopsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ToolVersion {
    type Error = HopsError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ToolVersion> for String {
    fn from(value: ToolVersion) -> Self {
        value.raw
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Compiler {
    pub family: CompilerFamily,
    pub version: ToolVersion,
}

impl fmt::Display for Compiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.version)
    }
}

/// The platform a build targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: OsFamily,
    pub arch: Arch,
    #[serde(default)]
    pub os_version: Option<String>,
    pub compiler: Compiler,
}

impl Platform {
    /// Host OS and architecture with the given compiler.
    pub fn host(compiler: Compiler) -> Self {
        Self {
            os: OsFamily::current(),
            arch: Arch::current(),
            os_version: None,
            compiler,
        }
    }
}
