// hops-common/src/dependency/definition.rs
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{HopsError, Result};
use crate::model::condition::{holds, Condition, EvalContext};
use crate::model::options::OptionSelection;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DependencyTag: u8 {
        const RUNTIME     = 0b00000001;
        const BUILD       = 0b00000010;
        const TEST        = 0b00000100;
        const OPTIONAL    = 0b00001000;
        const RECOMMENDED = 0b00010000;
    }
}

impl Default for DependencyTag {
    fn default() -> Self {
        Self::RUNTIME
    }
}

impl fmt::Display for DependencyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter_names().map(|(n, _)| n).collect();
        write!(f, "{}", names.join("|").to_lowercase())
    }
}

impl DependencyTag {
    pub fn parse_list(tags: &[String]) -> Result<Self> {
        let mut parsed = Self::empty();
        for tag in tags {
            parsed |= match tag.as_str() {
                "runtime" => Self::RUNTIME,
                "build" => Self::BUILD,
                "test" => Self::TEST,
                "optional" => Self::OPTIONAL,
                "recommended" => Self::RECOMMENDED,
                other => {
                    return Err(HopsError::Generic(format!(
                        "Unknown dependency tag '{other}'"
                    )))
                }
            };
        }
        // Build- or test-only edges stay that way; anything else is needed at runtime.
        if !parsed.intersects(Self::BUILD | Self::TEST) {
            parsed |= Self::RUNTIME;
        }
        Ok(parsed)
    }

    fn to_list(self) -> Vec<String> {
        self.iter_names().map(|(n, _)| n.to_lowercase()).collect()
    }

    /// Needed only while building.
    pub fn is_build_only(self) -> bool {
        self.contains(Self::BUILD) && !self.intersects(Self::RUNTIME | Self::TEST)
    }

    /// Gated on an implicit option (`with-<dep>` or `without-<dep>`).
    pub fn is_optional_kind(self) -> bool {
        self.intersects(Self::OPTIONAL | Self::RECOMMENDED)
    }
}

/// Serde adapter writing tags as a list of lowercase names.
pub(crate) mod tag_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::DependencyTag;

    pub fn serialize<S: Serializer>(tags: &DependencyTag, serializer: S) -> Result<S::Ok, S::Error> {
        tags.to_list().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DependencyTag, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        DependencyTag::parse_list(&names).map_err(serde::de::Error::custom)
    }
}

/// An edge to another formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDependency", into = "RawDependency")]
pub struct Dependency {
    pub name: String,
    pub tags: DependencyTag,
    pub when: Option<Condition>,
    /// Options requested from the dependency, e.g. `with-python`.
    pub options: OptionSelection,
}

/// JSON form: either `"name"` or an object with `tags`, `when` and `options`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Condition>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<String>,
    },
}

impl TryFrom<RawDependency> for Dependency {
    type Error = HopsError;

    fn try_from(raw: RawDependency) -> Result<Self> {
        match raw {
            RawDependency::Name(name) => Ok(Self::new_runtime(name)),
            RawDependency::Full {
                name,
                tags,
                when,
                options,
            } => Ok(Self {
                name,
                tags: DependencyTag::parse_list(&tags)?,
                when,
                options: OptionSelection::parse(options)?,
            }),
        }
    }
}

impl From<Dependency> for RawDependency {
    fn from(dep: Dependency) -> Self {
        RawDependency::Full {
            name: dep.name,
            tags: dep.tags.to_list(),
            when: dep.when,
            options: dep.options.entries(),
        }
    }
}

impl Dependency {
    pub fn new_runtime(name: impl Into<String>) -> Self {
        Self::new_with_tags(name, DependencyTag::RUNTIME)
    }

    pub fn new_with_tags(name: impl Into<String>, tags: DependencyTag) -> Self {
        Self {
            name: name.into(),
            tags,
            when: None,
            options: OptionSelection::default(),
        }
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Whether the edge exists under the given options and platform.
    ///
    /// Optional and recommended dependencies are gated on their implicit
    /// option feature (the dependency name).
    pub fn is_enabled(&self, ctx: &EvalContext<'_>, include_test: bool) -> bool {
        if self.tags.contains(DependencyTag::TEST)
            && !self.tags.intersects(DependencyTag::RUNTIME | DependencyTag::BUILD)
            && !include_test
        {
            return false;
        }
        if self.tags.is_optional_kind() && !ctx.options.with(&self.name) {
            return false;
        }
        holds(self.when.as_ref(), ctx)
    }
}

pub trait DependencyExt {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency>;
    fn runtime(&self) -> Vec<&Dependency>;
    fn build_time(&self) -> Vec<&Dependency>;
}

impl DependencyExt for Vec<Dependency> {
    fn filter_by_tags(&self, include: DependencyTag, exclude: DependencyTag) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| dep.tags.contains(include) && !dep.tags.intersects(exclude))
            .collect()
    }

    fn runtime(&self) -> Vec<&Dependency> {
        self.iter()
            .filter(|dep| {
                dep.tags.intersects(
                    DependencyTag::RUNTIME | DependencyTag::RECOMMENDED | DependencyTag::OPTIONAL,
                )
            })
            .collect()
    }

    fn build_time(&self) -> Vec<&Dependency> {
        self.filter_by_tags(DependencyTag::BUILD, DependencyTag::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_string_and_object_forms() {
        let deps: Vec<Dependency> = serde_json::from_str(
            r#"["readline",
                {"name": "pkg-config", "tags": ["build"]},
                {"name": "openblas", "tags": ["optional"]},
                {"name": "postgresql", "options": ["with-python"], "when": {"with": "python"}}]"#,
        )
        .unwrap();
        assert_eq!(deps[0].tags, DependencyTag::RUNTIME);
        assert!(deps[1].tags.is_build_only());
        assert_eq!(
            deps[2].tags,
            DependencyTag::OPTIONAL | DependencyTag::RUNTIME
        );
        assert!(deps[3].options.flags.contains("with-python"));
        assert!(deps[3].when.is_some());
        assert_eq!(deps.build_time().len(), 1);
        assert_eq!(deps.runtime().len(), 3);
    }

    #[test]
    fn rejects_unknown_tags() {
        let parsed: std::result::Result<Dependency, _> =
            serde_json::from_str(r#"{"name": "x", "tags": ["sometimes"]}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn serializes_tags_as_names() {
        let dep = Dependency::new_with_tags("cmake", DependencyTag::BUILD);
        let json = serde_json::to_value(&dep).unwrap();
        assert_eq!(json["tags"], serde_json::json!(["build"]));
    }
}
