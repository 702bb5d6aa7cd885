// hops-common/src/model/options.rs
//! Build options: declarations, user selections and the resolved view.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{HopsError, Result};

/// A declared build option.
///
/// Boolean options are named `with-<feature>` (off by default) or
/// `without-<feature>` (on by default). An option with `values` is a choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDecl {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind<'a> {
    With(&'a str),
    Without(&'a str),
    Choice,
}

impl OptionDecl {
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            desc: None,
            values: Vec::new(),
            default: None,
        }
    }

    pub fn kind(&self) -> Option<OptionKind<'_>> {
        if !self.values.is_empty() {
            return Some(OptionKind::Choice);
        }
        if let Some(feature) = self.name.strip_prefix("without-") {
            return (!feature.is_empty()).then_some(OptionKind::Without(feature));
        }
        if let Some(feature) = self.name.strip_prefix("with-") {
            return (!feature.is_empty()).then_some(OptionKind::With(feature));
        }
        None
    }

    /// The feature a boolean option controls.
    pub fn feature(&self) -> Option<&str> {
        match self.kind()? {
            OptionKind::With(f) | OptionKind::Without(f) => Some(f),
            OptionKind::Choice => None,
        }
    }

    pub(crate) fn validate(&self, formula: &str) -> Result<()> {
        match self.kind() {
            None => Err(HopsError::malformed(
                formula,
                format!(
                    "option '{}' must start with 'with-' or 'without-' or declare values",
                    self.name
                ),
            )),
            Some(OptionKind::Choice) => {
                if self.name.contains('=') || self.name.is_empty() {
                    return Err(HopsError::malformed(
                        formula,
                        format!("invalid choice option name '{}'", self.name),
                    ));
                }
                let unique: BTreeSet<&String> = self.values.iter().collect();
                if unique.len() != self.values.len() {
                    return Err(HopsError::malformed(
                        formula,
                        format!("choice option '{}' repeats a value", self.name),
                    ));
                }
                if let Some(default) = &self.default {
                    if !self.values.contains(default) {
                        return Err(HopsError::malformed(
                            formula,
                            format!(
                                "default '{}' of option '{}' is not one of {:?}",
                                default, self.name, self.values
                            ),
                        ));
                    }
                }
                Ok(())
            }
            Some(_) if self.default.is_some() => Err(HopsError::malformed(
                formula,
                format!("flag option '{}' cannot declare a default", self.name),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Options requested for one formula, as given on the command line or by a
/// dependent formula: `with-x`, `without-x` and `name=value` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OptionSelection {
    #[serde(default)]
    pub flags: BTreeSet<String>,
    #[serde(default)]
    pub choices: BTreeMap<String, String>,
}

impl OptionSelection {
    pub fn parse<I, S>(items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selection = Self::default();
        for item in items {
            selection.insert(item.as_ref())?;
        }
        Ok(selection)
    }

    pub fn insert(&mut self, raw: &str) -> Result<()> {
        let raw = raw.trim().trim_start_matches("--");
        if let Some((name, value)) = raw.split_once('=') {
            if name.is_empty() || value.is_empty() {
                return Err(HopsError::Config(format!("Invalid option '{raw}'")));
            }
            self.choices.insert(name.to_string(), value.to_string());
        } else if raw.starts_with("with-") || raw.starts_with("without-") {
            self.flags.insert(raw.to_string());
        } else {
            return Err(HopsError::Config(format!(
                "Invalid option '{raw}': expected with-<x>, without-<x> or <name>=<value>"
            )));
        }
        Ok(())
    }

    /// Adds every entry of `other`; returns whether anything new was added.
    ///
    /// Two different values for the same choice of `formula` cannot both be
    /// honored and fail with `InvalidOption`.
    pub fn merge(&mut self, formula: &str, other: &OptionSelection) -> Result<bool> {
        for (name, value) in &other.choices {
            if let Some(current) = self.choices.get(name).filter(|c| *c != value) {
                return Err(HopsError::InvalidOption {
                    formula: formula.to_string(),
                    reason: format!("'{name}={value}' conflicts with '{name}={current}'"),
                });
            }
        }
        let mut changed = false;
        for flag in &other.flags {
            changed |= self.flags.insert(flag.clone());
        }
        for (name, value) in &other.choices {
            changed |= self.choices.insert(name.clone(), value.clone()).is_none();
        }
        Ok(changed)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty() && self.choices.is_empty()
    }

    pub fn entries(&self) -> Vec<String> {
        self.flags
            .iter()
            .cloned()
            .chain(self.choices.iter().map(|(k, v)| format!("{k}={v}")))
            .collect()
    }
}

/// Effective option values for one formula: every declared feature mapped to
/// on/off and every choice option mapped to its value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnabledOptions {
    features: BTreeMap<String, bool>,
    choices: BTreeMap<String, String>,
}

impl EnabledOptions {
    pub fn resolve(
        formula: &str,
        declared: &[OptionDecl],
        selection: &OptionSelection,
    ) -> Result<Self> {
        let invalid = |reason: String| HopsError::InvalidOption {
            formula: formula.to_string(),
            reason,
        };

        let mut features = BTreeMap::new();
        let mut choices = BTreeMap::new();
        for decl in declared {
            match decl.kind() {
                Some(OptionKind::With(feature)) => {
                    features.insert(feature.to_string(), false);
                }
                Some(OptionKind::Without(feature)) => {
                    features.insert(feature.to_string(), true);
                }
                Some(OptionKind::Choice) => {
                    let value = decl
                        .default
                        .clone()
                        .or_else(|| decl.values.first().cloned())
                        .unwrap_or_default();
                    choices.insert(decl.name.clone(), value);
                }
                None => {}
            }
        }

        for flag in &selection.flags {
            let (feature, enabled) = match flag.strip_prefix("without-") {
                Some(f) => (f, false),
                None => (flag.trim_start_matches("with-"), true),
            };
            let opposite = if enabled {
                format!("without-{feature}")
            } else {
                format!("with-{feature}")
            };
            if selection.flags.contains(&opposite) {
                return Err(invalid(format!("'{flag}' conflicts with '{opposite}'")));
            }
            match features.get_mut(feature) {
                Some(state) => *state = enabled,
                None => return Err(invalid(format!("unknown option '{flag}'"))),
            }
        }

        for (name, value) in &selection.choices {
            let decl = declared
                .iter()
                .find(|d| &d.name == name && d.kind() == Some(OptionKind::Choice))
                .ok_or_else(|| invalid(format!("unknown option '{name}'")))?;
            if !decl.values.contains(value) {
                return Err(invalid(format!(
                    "'{value}' is not a valid value for '{name}' (expected one of {:?})",
                    decl.values
                )));
            }
            choices.insert(name.clone(), value.clone());
        }

        Ok(Self { features, choices })
    }

    /// Whether `feature` is enabled. Undeclared features are off.
    pub fn with(&self, feature: &str) -> bool {
        self.features.get(feature).copied().unwrap_or(false)
    }

    pub fn choice(&self, name: &str) -> Option<&str> {
        self.choices.get(name).map(String::as_str)
    }

    /// Canonical `with-x` / `without-x` / `name=value` rendering of all values.
    pub fn canonical(&self) -> Vec<String> {
        self.features
            .iter()
            .map(|(feature, on)| {
                if *on {
                    format!("with-{feature}")
                } else {
                    format!("without-{feature}")
                }
            })
            .chain(self.choices.iter().map(|(k, v)| format!("{k}={v}")))
            .collect()
    }
}
