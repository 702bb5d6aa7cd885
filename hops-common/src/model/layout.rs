// hops-common/src/model/layout.rs
//! Declarative install mapping: how staged output lands in the keg.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::condition::Condition;

/// Content categories of an installed keg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Bin,
    Sbin,
    Lib,
    Include,
    Share,
    Doc,
    Man,
    Libexec,
    Frameworks,
    Etc,
    /// Anything else, relative to the keg root.
    Prefix,
}

impl Category {
    pub const ALL: [Category; 11] = [
        Category::Bin,
        Category::Sbin,
        Category::Lib,
        Category::Include,
        Category::Share,
        Category::Doc,
        Category::Man,
        Category::Libexec,
        Category::Frameworks,
        Category::Etc,
        Category::Prefix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bin => "bin",
            Self::Sbin => "sbin",
            Self::Lib => "lib",
            Self::Include => "include",
            Self::Share => "share",
            Self::Doc => "doc",
            Self::Man => "man",
            Self::Libexec => "libexec",
            Self::Frameworks => "frameworks",
            Self::Etc => "etc",
            Self::Prefix => "prefix",
        }
    }

    /// Directory of the category relative to the keg root.
    pub fn relative_dir(&self, formula: &str) -> PathBuf {
        match self {
            Self::Bin => PathBuf::from("bin"),
            Self::Sbin => PathBuf::from("sbin"),
            Self::Lib => PathBuf::from("lib"),
            Self::Include => PathBuf::from("include"),
            Self::Share => PathBuf::from("share"),
            Self::Doc => PathBuf::from("share/doc").join(formula),
            Self::Man => PathBuf::from("share/man"),
            Self::Libexec => PathBuf::from("libexec"),
            Self::Frameworks => PathBuf::from("Frameworks"),
            Self::Etc => PathBuf::from("etc"),
            Self::Prefix => PathBuf::new(),
        }
    }

    /// Classifies a keg-relative path by its leading directories.
    pub fn classify(relative: &std::path::Path) -> Category {
        let mut components = relative.components().map(|c| c.as_os_str().to_string_lossy());
        match components.next().as_deref() {
            Some("bin") => Self::Bin,
            Some("sbin") => Self::Sbin,
            Some("lib") => Self::Lib,
            Some("include") => Self::Include,
            Some("libexec") => Self::Libexec,
            Some("Frameworks") => Self::Frameworks,
            Some("etc") => Self::Etc,
            Some("share") => match components.next().as_deref() {
                Some("doc") => Self::Doc,
                Some("man") => Self::Man,
                _ => Self::Share,
            },
            _ => Self::Prefix,
        }
    }

    /// Categories whose presence makes a keg usable.
    pub fn is_entry_point(&self) -> bool {
        matches!(self, Self::Bin | Self::Sbin | Self::Lib | Self::Frameworks)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copies staged paths matching `from` (a glob relative to the staged
/// content root) into a category directory, optionally below `subdir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRule {
    pub from: String,
    pub into: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

/// A relative symlink inside the keg: `link` points at `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub link: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

/// A forwarding script written at `path` (keg-relative) that execs `target`
/// with extra environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimSpec {
    pub path: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<InstallRule>,
    /// Keg-relative directories that must be real directories, not symlinks.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub real_dirs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shims: Vec<ShimSpec>,
}
