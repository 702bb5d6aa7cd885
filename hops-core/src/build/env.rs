// hops-core/src/build/env.rs
//! Sanitized per-build environment.
//!
//! Nothing here touches the process environment: a [`BuildEnvironment`] is a
//! plain map built from an explicit base environment and handed to every
//! step's [`CommandSpec`](hops_aio::CommandSpec) with `clear_env` set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use hops_common::dependency::DependencyTag;
use hops_common::error::Result;
use hops_common::model::condition::{holds, EvalContext};
use hops_common::model::formula::{EnvDirective, EnvOp};
use hops_common::model::platform::{Compiler, CompilerFamily};
use hops_common::template::TemplateVars;
use serde::Serialize;
use tracing::debug;

// Variables passed through from the caller's environment. PATH is rebuilt.
const ENV_VARS_TO_KEEP: &[&str] = &[
    "USER",
    "LOGNAME",
    "HOME",
    "TMPDIR",
    "TERM",
    "SHELL",
    "EDITOR",
    "LANG",
    "LC_ALL",
    "LC_CTYPE",
    "DISPLAY",
    "XAUTHORITY",
    "TZ",
];

const SYSTEM_PATH_DIRS: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// Install location of one dependency as seen by a dependent build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyPrefix {
    pub name: String,
    /// Versioned keg when known, otherwise the opt path.
    pub prefix: PathBuf,
    /// Stable `opt/<name>` path; used for all flags.
    pub opt: PathBuf,
    pub tags: DependencyTag,
}

pub struct EnvInputs<'a> {
    pub base_env: &'a BTreeMap<String, String>,
    pub dependencies: &'a [DependencyPrefix],
    pub hops_prefix: &'a Path,
    pub staging: &'a Path,
    pub compiler: &'a Compiler,
    pub jobs: usize,
    pub tmp_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildEnvironment {
    vars: BTreeMap<String, String>,
}

impl BuildEnvironment {
    pub fn new(inputs: &EnvInputs<'_>) -> Self {
        let mut vars: BTreeMap<String, String> = inputs
            .base_env
            .iter()
            .filter(|(k, _)| ENV_VARS_TO_KEEP.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let deps = inputs.dependencies;
        let mut path_dirs: Vec<PathBuf> = Vec::new();
        for dep in deps {
            path_dirs.push(dep.opt.join("bin"));
            path_dirs.push(dep.opt.join("sbin"));
        }
        path_dirs.push(inputs.hops_prefix.join("bin"));
        if let Some(base_path) = inputs.base_env.get("PATH") {
            path_dirs.extend(std::env::split_paths(base_path));
        }
        path_dirs.extend(SYSTEM_PATH_DIRS.iter().map(PathBuf::from));
        let mut seen = std::collections::HashSet::new();
        path_dirs.retain(|p| !p.as_os_str().is_empty() && seen.insert(p.clone()));
        vars.insert("PATH".to_string(), join_paths(&path_dirs, ":"));

        let (cc, cxx) = match inputs.compiler.family {
            CompilerFamily::Unknown => ("cc", "c++"),
            family => family.drivers(),
        };
        vars.insert("CC".to_string(), cc.to_string());
        vars.insert("CXX".to_string(), cxx.to_string());

        let flags = |flag: &str, sub: &str| -> String {
            deps.iter()
                .map(|d| format!("{flag}{}", d.opt.join(sub).display()))
                .collect::<Vec<_>>()
                .join(" ")
        };
        let mut env = Self { vars };
        env.set_nonempty("CPPFLAGS", flags("-I", "include"));
        env.set_nonempty("LDFLAGS", flags("-L", "lib"));

        let pkg_config: Vec<PathBuf> = deps
            .iter()
            .flat_map(|d| [d.opt.join("lib/pkgconfig"), d.opt.join("share/pkgconfig")])
            .collect();
        env.set_path_list_var("PKG_CONFIG_PATH", &pkg_config, ":");
        let aclocal: Vec<PathBuf> = deps.iter().map(|d| d.opt.join("share/aclocal")).collect();
        env.set_path_list_var("ACLOCAL_PATH", &aclocal, ":");
        let cmake: Vec<PathBuf> = deps.iter().map(|d| d.opt.clone()).collect();
        env.set_path_list_var("CMAKE_PREFIX_PATH", &cmake, ":");

        env.set("MAKEFLAGS", format!("-j{}", inputs.jobs.max(1)));
        env.set("DESTDIR", inputs.staging.display().to_string());
        if let Some(tmp) = inputs.tmp_dir {
            env.set("TMPDIR", tmp.display().to_string());
        }
        debug!(
            "Build environment: {} variables, {} dependency prefixes",
            env.vars.len(),
            deps.len()
        );
        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn get_path_string(&self) -> Option<&str> {
        self.get("PATH")
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    fn set_nonempty(&mut self, key: &str, value: String) {
        if !value.is_empty() {
            self.set(key, value);
        }
    }

    fn set_path_list_var(&mut self, name: &str, paths: &[PathBuf], separator: &str) {
        if paths.is_empty() {
            return;
        }
        self.set(name, join_paths(paths, separator));
    }

    /// Applies formula `env` directives whose conditions hold. Values are
    /// rendered with `vars` first.
    pub fn apply_directives(
        &mut self,
        directives: &[EnvDirective],
        ctx: &EvalContext<'_>,
        vars: &TemplateVars,
    ) -> Result<()> {
        for directive in directives.iter().filter(|d| holds(d.when.as_ref(), ctx)) {
            let value = vars.render(&directive.value)?;
            let sep = directive.separator.as_deref().unwrap_or(" ");
            let current = self.vars.get(&directive.var).cloned();
            debug!("env {:?} {} '{}'", directive.op, directive.var, value);
            match directive.op {
                EnvOp::Set => self.set(directive.var.clone(), value),
                EnvOp::Append => {
                    let joined = match current.filter(|c| !c.is_empty()) {
                        Some(c) => format!("{c}{sep}{value}"),
                        None => value,
                    };
                    self.set(directive.var.clone(), joined);
                }
                EnvOp::Prepend => {
                    let joined = match current.filter(|c| !c.is_empty()) {
                        Some(c) => format!("{value}{sep}{c}"),
                        None => value,
                    };
                    self.set(directive.var.clone(), joined);
                }
                EnvOp::Remove if value.is_empty() => self.unset(&directive.var),
                EnvOp::Remove => {
                    if let Some(c) = current {
                        let remaining = c
                            .replace(&value, "")
                            .split(sep)
                            .filter(|part| !part.trim().is_empty())
                            .collect::<Vec<_>>()
                            .join(sep);
                        if remaining.is_empty() {
                            self.unset(&directive.var);
                        } else {
                            self.set(directive.var.clone(), remaining);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn join_paths(paths: &[PathBuf], separator: &str) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(separator)
}

/// Snapshot of the current process environment, used as the base for
/// sanitization.
pub fn host_env() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

#[cfg(test)]
mod tests {
    use hops_common::model::options::EnabledOptions;
    use hops_common::model::platform::{Platform, ToolVersion};

    use super::*;

    fn clang() -> Compiler {
        Compiler {
            family: CompilerFamily::Clang,
            version: ToolVersion::parse("7.0.0").unwrap(),
        }
    }

    fn dep(name: &str) -> DependencyPrefix {
        DependencyPrefix {
            name: name.to_string(),
            prefix: PathBuf::from(format!("/opt/hops/Cellar/{name}/1.0")),
            opt: PathBuf::from(format!("/opt/hops/opt/{name}")),
            tags: DependencyTag::RUNTIME,
        }
    }

    fn build(base: &BTreeMap<String, String>, deps: &[DependencyPrefix]) -> BuildEnvironment {
        let compiler = clang();
        BuildEnvironment::new(&EnvInputs {
            base_env: base,
            dependencies: deps,
            hops_prefix: Path::new("/opt/hops"),
            staging: Path::new("/opt/hops/tmp/r/stage"),
            compiler: &compiler,
            jobs: 4,
            tmp_dir: None,
        })
    }

    #[test]
    fn keeps_only_whitelisted_base_vars() {
        let base = BTreeMap::from([
            ("HOME".to_string(), "/Users/me".to_string()),
            ("PYTHONPATH".to_string(), "/tmp/py".to_string()),
            ("CFLAGS".to_string(), "-O0".to_string()),
            ("PATH".to_string(), "/usr/local/bin:/usr/bin".to_string()),
        ]);
        let env = build(&base, &[]);
        assert_eq!(env.get("HOME"), Some("/Users/me"));
        assert_eq!(env.get("PYTHONPATH"), None);
        assert_eq!(env.get("CFLAGS"), None);
        assert_eq!(
            env.get_path_string(),
            Some("/opt/hops/bin:/usr/local/bin:/usr/bin:/bin:/usr/sbin:/sbin")
        );
        assert_eq!(env.get("CC"), Some("clang"));
        assert_eq!(env.get("MAKEFLAGS"), Some("-j4"));
        assert_eq!(env.get("DESTDIR"), Some("/opt/hops/tmp/r/stage"));
        assert_eq!(env.get("CPPFLAGS"), None);
    }

    #[test]
    fn dependency_prefixes_feed_search_paths() {
        let env = build(&BTreeMap::new(), &[dep("readline"), dep("gettext")]);
        assert!(env
            .get_path_string()
            .unwrap()
            .starts_with("/opt/hops/opt/readline/bin:/opt/hops/opt/readline/sbin:"));
        assert_eq!(
            env.get("CPPFLAGS"),
            Some("-I/opt/hops/opt/readline/include -I/opt/hops/opt/gettext/include")
        );
        assert_eq!(
            env.get("LDFLAGS"),
            Some("-L/opt/hops/opt/readline/lib -L/opt/hops/opt/gettext/lib")
        );
        assert!(env
            .get("PKG_CONFIG_PATH")
            .unwrap()
            .contains("/opt/hops/opt/gettext/share/pkgconfig"));
        assert_eq!(
            env.get("CMAKE_PREFIX_PATH"),
            Some("/opt/hops/opt/readline:/opt/hops/opt/gettext")
        );
    }

    #[test]
    fn directives_follow_conditions_and_ops() {
        let mut env = build(&BTreeMap::new(), &[dep("readline")]);
        let options = EnabledOptions::default();
        let platform = Platform::host(clang());
        let ctx = EvalContext {
            options: &options,
            platform: &platform,
        };
        let mut vars = TemplateVars::for_formula("r");
        vars.insert("hops_prefix", "/opt/hops");

        let directives: Vec<EnvDirective> = serde_json::from_str(
            r#"[
                {"var": "LDFLAGS", "op": "append", "value": "-L{hops_prefix}/lib"},
                {"var": "LDFLAGS", "op": "remove", "value": "-L/opt/hops/opt/readline/lib"},
                {"var": "CXXFLAGS", "op": "set", "value": "-stdlib=libstdc++",
                 "when": {"compiler": {"family": "clang"}}},
                {"var": "CFLAGS", "op": "set", "value": "-Og", "when": {"with": "valgrind"}},
                {"var": "PATH", "op": "prepend", "value": "/x/bin", "separator": ":"},
                {"var": "DESTDIR", "op": "remove"}
            ]"#,
        )
        .unwrap();
        env.apply_directives(&directives, &ctx, &vars).unwrap();

        assert_eq!(env.get("LDFLAGS"), Some("-L/opt/hops/lib"));
        assert_eq!(env.get("CXXFLAGS"), Some("-stdlib=libstdc++"));
        assert_eq!(env.get("CFLAGS"), None);
        assert!(env.get_path_string().unwrap().starts_with("/x/bin:"));
        assert_eq!(env.get("DESTDIR"), None);
    }
}
