// hops-common/src/template.rs
//! `{placeholder}` substitution for formula arguments, paths and scripts.
//!
//! `{{` and `}}` render literal braces.

use std::collections::BTreeMap;

use crate::error::{HopsError, Result};

/// Placeholders every formula may use without further declaration.
pub const BUILTIN_PLACEHOLDERS: &[&str] = &[
    "prefix",
    "opt",
    "bin",
    "sbin",
    "lib",
    "include",
    "share",
    "doc",
    "man",
    "libexec",
    "etc",
    "frameworks",
    "buildpath",
    "staging",
    "version",
    "name",
    "jobs",
    "os",
    "arch",
    "hops_prefix",
    "testpath",
];

/// Splits a template into literal text and placeholder keys.
fn scan(template: &str) -> std::result::Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let bytes = template.as_bytes();
    let mut literal_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                segments.push(Segment::Literal(&template[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                segments.push(Segment::Literal(&template[literal_start..i + 1]));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                segments.push(Segment::Literal(&template[literal_start..i]));
                let close = template[i + 1..]
                    .find('}')
                    .ok_or_else(|| format!("unclosed placeholder in '{template}'"))?;
                let key = &template[i + 1..i + 1 + close];
                if key.is_empty() || key.contains('{') {
                    return Err(format!("empty or nested placeholder in '{template}'"));
                }
                segments.push(Segment::Key(key));
                i += close + 2;
                literal_start = i;
            }
            b'}' => return Err(format!("unmatched '}}' in '{template}'")),
            _ => i += 1,
        }
    }
    segments.push(Segment::Literal(&template[literal_start..]));
    Ok(segments)
}

enum Segment<'a> {
    Literal(&'a str),
    Key(&'a str),
}

/// Lists the placeholder keys used by `template`.
pub fn placeholders(template: &str) -> std::result::Result<Vec<String>, String> {
    Ok(scan(template)?
        .into_iter()
        .filter_map(|s| match s {
            Segment::Key(k) => Some(k.to_string()),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Values available to templates of one formula.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    formula: String,
    values: BTreeMap<String, String>,
    env: Option<BTreeMap<String, String>>,
}

impl TemplateVars {
    pub fn for_formula(formula: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            ..Self::default()
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Enables `{env:NAME}` lookups against the given environment.
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn render(&self, template: &str) -> Result<String> {
        let segments =
            scan(template).map_err(|reason| HopsError::malformed(&self.formula, reason))?;
        let mut out = String::with_capacity(template.len());
        for segment in segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Key(key) => out.push_str(self.lookup(key, template)?),
            }
        }
        Ok(out)
    }

    pub fn render_all(&self, templates: &[String]) -> Result<Vec<String>> {
        templates.iter().map(|t| self.render(t)).collect()
    }

    fn lookup<'a>(&'a self, key: &str, template: &str) -> Result<&'a str> {
        if let Some(value) = self.values.get(key) {
            return Ok(value);
        }
        if let (Some(var), Some(env)) = (key.strip_prefix("env:"), &self.env) {
            return Ok(env.get(var).map(String::as_str).unwrap_or(""));
        }
        Err(HopsError::malformed(
            &self.formula,
            format!("unresolved placeholder '{{{key}}}' in '{template}'"),
        ))
    }
}
