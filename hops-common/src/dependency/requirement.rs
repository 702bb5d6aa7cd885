// hops-common/src/dependency/requirement.rs
use std::fmt;

use serde::{Deserialize, Serialize};

use super::definition::DependencyTag;
use crate::model::condition::{holds, Condition, EvalContext};

/// An external tool the build needs but no formula provides, such as a
/// Fortran compiler or an X11 server. Satisfied when one of `executables`
/// (default: the requirement name) is found on `PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executables: Vec<String>,
    #[serde(default = "default_tags", with = "super::definition::tag_list")]
    pub tags: DependencyTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Condition>,
    /// Unsatisfied fatal requirements abort the build before it starts.
    #[serde(default = "default_fatal")]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn default_tags() -> DependencyTag {
    DependencyTag::BUILD | DependencyTag::RUNTIME
}

fn default_fatal() -> bool {
    true
}

impl Requirement {
    pub fn executables(&self) -> Vec<&str> {
        if self.executables.is_empty() {
            vec![self.name.as_str()]
        } else {
            self.executables.iter().map(String::as_str).collect()
        }
    }

    pub fn is_enabled(&self, ctx: &EvalContext<'_>) -> bool {
        if self.tags.is_optional_kind() && !ctx.options.with(&self.name) {
            return false;
        }
        holds(self.when.as_ref(), ctx)
    }

    pub fn hint(&self) -> String {
        self.hint
            .clone()
            .unwrap_or_else(|| format!("install one of: {}", self.executables().join(", ")))
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Requirement: {}", self.name)
    }
}
