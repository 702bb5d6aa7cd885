// hops-common/src/model/condition.rs
use serde::{Deserialize, Serialize};

use super::options::{EnabledOptions, OptionDecl, OptionKind};
use super::platform::{Arch, CompilerFamily, OsFamily, Platform, ToolVersion};
use crate::error::{HopsError, Result};

/// A predicate over options and platform that gates dependencies, patches,
/// arguments, environment directives and steps.
///
/// In JSON: `"always"`, `{"with": "check"}`, `{"os": "macos"}`,
/// `{"compiler": {"family": "clang", "min_version": "6.0"}}`,
/// `{"not": {"with": "x11"}}`, `{"any": [...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Always,
    With(String),
    Without(String),
    Choice {
        name: String,
        value: String,
    },
    Os(OsFamily),
    Arch(Arch),
    Compiler {
        family: CompilerFamily,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_version: Option<ToolVersion>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_version: Option<ToolVersion>,
    },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub options: &'a EnabledOptions,
    pub platform: &'a Platform,
}

impl Condition {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Self::Always => true,
            Self::With(feature) => ctx.options.with(feature),
            Self::Without(feature) => !ctx.options.with(feature),
            Self::Choice { name, value } => ctx.options.choice(name) == Some(value.as_str()),
            Self::Os(os) => ctx.platform.os == *os,
            Self::Arch(arch) => ctx.platform.arch == *arch,
            Self::Compiler {
                family,
                min_version,
                max_version,
            } => {
                let compiler = &ctx.platform.compiler;
                compiler.family == *family
                    && min_version.as_ref().is_none_or(|min| compiler.version >= *min)
                    && max_version.as_ref().is_none_or(|max| compiler.version <= *max)
            }
            Self::All(conditions) => conditions.iter().all(|c| c.evaluate(ctx)),
            Self::Any(conditions) => conditions.iter().any(|c| c.evaluate(ctx)),
            Self::Not(inner) => !inner.evaluate(ctx),
        }
    }

    /// Checks that every option the condition mentions is declared.
    pub(crate) fn check(&self, formula: &str, declared: &[OptionDecl]) -> Result<()> {
        match self {
            Self::With(feature) | Self::Without(feature) => {
                let known = declared.iter().any(|d| d.feature() == Some(feature.as_str()));
                if known {
                    Ok(())
                } else {
                    Err(HopsError::malformed(
                        formula,
                        format!("condition refers to undeclared option feature '{feature}'"),
                    ))
                }
            }
            Self::Choice { name, value } => {
                let decl = declared
                    .iter()
                    .find(|d| &d.name == name && d.kind() == Some(OptionKind::Choice))
                    .ok_or_else(|| {
                        HopsError::malformed(
                            formula,
                            format!("condition refers to undeclared choice option '{name}'"),
                        )
                    })?;
                if decl.values.contains(value) {
                    Ok(())
                } else {
                    Err(HopsError::malformed(
                        formula,
                        format!("condition compares '{name}' against unknown value '{value}'"),
                    ))
                }
            }
            Self::Compiler {
                family: CompilerFamily::Unknown,
                ..
            } => Err(HopsError::malformed(
                formula,
                "condition cannot match the unknown compiler family",
            )),
            Self::All(conditions) | Self::Any(conditions) => conditions
                .iter()
                .try_for_each(|c| c.check(formula, declared)),
            Self::Not(inner) => inner.check(formula, declared),
            _ => Ok(()),
        }
    }
}

/// Evaluates an optional condition; absent conditions hold.
pub fn holds(condition: Option<&Condition>, ctx: &EvalContext<'_>) -> bool {
    condition.is_none_or(|c| c.evaluate(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::options::OptionSelection;
    use crate::model::platform::Compiler;

    fn platform(os: OsFamily, family: CompilerFamily, version: &str) -> Platform {
        Platform {
            os,
            arch: Arch::X86_64,
            os_version: None,
            compiler: Compiler {
                family,
                version: ToolVersion::parse(version).unwrap(),
            },
        }
    }

    #[test]
    fn parses_and_evaluates_nested_conditions() {
        let json = r#"{"all": [{"os": "macos"}, {"not": {"compiler": {"family": "clang"}}}]}"#;
        let cond: Condition = serde_json::from_str(json).unwrap();
        let opts = EnabledOptions::default();

        let mac_gcc = platform(OsFamily::Macos, CompilerFamily::Gcc, "4.2");
        let mac_clang = platform(OsFamily::Macos, CompilerFamily::Clang, "6.0");
        assert!(cond.evaluate(&EvalContext {
            options: &opts,
            platform: &mac_gcc
        }));
        assert!(!cond.evaluate(&EvalContext {
            options: &opts,
            platform: &mac_clang
        }));
    }

    #[test]
    fn compiler_bounds_are_inclusive() {
        let cond: Condition = serde_json::from_str(
            r#"{"compiler": {"family": "clang", "min_version": "6.0", "max_version": "7.0"}}"#,
        )
        .unwrap();
        let opts = EnabledOptions::default();
        for (version, expected) in [("5.1", false), ("6.0", true), ("7.0", true), ("7.3", false)] {
            let p = platform(OsFamily::Macos, CompilerFamily::Clang, version);
            let ctx = EvalContext {
                options: &opts,
                platform: &p,
            };
            assert_eq!(cond.evaluate(&ctx), expected, "clang {version}");
        }
    }

    #[test]
    fn option_conditions_follow_enabled_features() {
        let declared = vec![OptionDecl::flag("with-check")];
        let selection = OptionSelection::parse(["with-check"]).unwrap();
        let opts = EnabledOptions::resolve("r", &declared, &selection).unwrap();
        let p = platform(OsFamily::Linux, CompilerFamily::Gcc, "9");
        let ctx = EvalContext {
            options: &opts,
            platform: &p,
        };
        assert!(Condition::With("check".into()).evaluate(&ctx));
        assert!(!Condition::Without("check".into()).evaluate(&ctx));
    }

    #[test]
    fn check_rejects_undeclared_features() {
        let declared = vec![OptionDecl::flag("with-check")];
        assert!(Condition::With("check".into()).check("r", &declared).is_ok());
        let nested = Condition::Any(vec![Condition::With("gui".into())]);
        assert!(matches!(
            nested.check("r", &declared),
            Err(HopsError::MalformedFormula { .. })
        ));
    }
}
