// hops-core/src/install/materializer.rs
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use hops_aio::fs::{
    copy_dir_recursive, copy_entry, relative_path, remove_path, replace_symlink, set_permissions,
};
use hops_aio::json_io::write_json_sync;
use hops_common::error::{HopsError, Result};
use hops_common::model::condition::{holds, EvalContext};
use hops_common::model::layout::{Category, InstallRule};
use hops_common::model::options::EnabledOptions;
use hops_common::model::platform::Platform;
use hops_common::model::Formula;
use hops_common::template::TemplateVars;
use hops_common::{MANIFEST_FILENAME, RECEIPT_FILENAME};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::build::env::DependencyPrefix;
use crate::build::plan::{insert_dependency_vars, install_vars};

// Directory names that mean "this is already the keg layout".
const STANDARD_KEG_DIRS: &[&str] = &[
    "bin",
    "sbin",
    "lib",
    "libexec",
    "include",
    "share",
    "etc",
    "Frameworks",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub link: PathBuf,
    pub target: PathBuf,
}

/// What ended up in a keg. Written as the install manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationLayout {
    pub name: String,
    pub version: String,
    pub keg: PathBuf,
    pub opt: PathBuf,
    /// Keg-relative files and symlinks per category, sorted.
    pub entries: BTreeMap<Category, Vec<PathBuf>>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    #[serde(default)]
    pub shims: Vec<PathBuf>,
}

impl InstallationLayout {
    pub fn load(keg: &Path) -> Result<Self> {
        hops_aio::json_io::read_json_sync(&keg.join(MANIFEST_FILENAME))
    }

    pub fn entry_points(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.entries
            .iter()
            .filter(|(category, _)| category.is_entry_point())
            .flat_map(|(_, paths)| paths.iter().map(|p| self.keg.join(p)))
    }

    pub fn has_entry_point(&self) -> bool {
        self.entry_points().next().is_some()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub build_hash: String,
    pub options: Vec<String>,
    pub platform: Platform,
    pub dependencies: Vec<String>,
    pub source_url: String,
    pub source_sha256: String,
}

pub struct MaterializeRequest<'a> {
    pub formula: &'a Formula,
    pub options: &'a EnabledOptions,
    pub platform: &'a Platform,
    pub staging: &'a Path,
    pub keg: &'a Path,
    pub opt: &'a Path,
    pub hops_prefix: &'a Path,
    pub dependencies: &'a [DependencyPrefix],
    pub build_hash: &'a str,
}

/// Copies a build's staged output into its keg and records what landed.
///
/// The keg is recreated from scratch each time, so running this twice on
/// the same staging directory yields the same keg.
pub fn materialize(request: &MaterializeRequest<'_>) -> Result<InstallationLayout> {
    let formula = request.formula;
    let keg = request.keg;
    let ctx = EvalContext {
        options: request.options,
        platform: request.platform,
    };
    let mut vars = install_vars(formula, keg, request.opt, request.hops_prefix, request.platform);
    vars.insert("staging", request.staging.display().to_string());
    insert_dependency_vars(&mut vars, request.dependencies);
    let vars = vars.with_env(BTreeMap::new());

    let content_root = content_root(formula.name(), request.staging, keg)?;
    info!(
        "==> Installing {} {} from {}",
        formula.name(),
        formula.version_str_full(),
        content_root.display()
    );

    remove_path(keg)?;
    fs::create_dir_all(keg)?;

    let rules: Vec<&InstallRule> = formula
        .install
        .rules
        .iter()
        .filter(|r| holds(r.when.as_ref(), &ctx))
        .collect();
    if rules.is_empty() {
        let copied = copy_dir_recursive(&content_root, keg)?;
        debug!("Copied {} entries into {}", copied, keg.display());
    } else {
        for rule in rules {
            apply_rule(formula.name(), rule, &content_root, keg)?;
        }
    }

    for dir in &formula.install.real_dirs {
        make_real_dir(&keg.join(dir))?;
    }

    let mut links = Vec::new();
    for spec in formula
        .install
        .links
        .iter()
        .filter(|l| holds(l.when.as_ref(), &ctx))
    {
        links.push(create_link(keg, &spec.link, &vars.render(&spec.target)?)?);
    }

    let mut shims = Vec::new();
    for spec in formula
        .install
        .shims
        .iter()
        .filter(|s| holds(s.when.as_ref(), &ctx))
    {
        let mut env = BTreeMap::new();
        for (key, value) in &spec.env {
            env.insert(key.clone(), vars.render(value)?);
        }
        let path = PathBuf::from(&spec.path);
        write_shim(&keg.join(&path), &vars.render(&spec.target)?, &env)?;
        shims.push(path);
    }

    let layout = InstallationLayout {
        name: formula.name().to_string(),
        version: formula.version_str_full(),
        keg: keg.to_path_buf(),
        opt: request.opt.to_path_buf(),
        entries: scan_keg(keg)?,
        links,
        shims,
    };
    if !layout.has_entry_point() {
        let err = HopsError::InstallError(format!(
            "{}: nothing was installed into bin, sbin, lib or Frameworks of {}",
            formula.name(),
            keg.display()
        ));
        error!("{}", err);
        return Err(err);
    }

    replace_symlink(keg, request.opt)?;
    write_json_sync(&keg.join(MANIFEST_FILENAME), &layout)?;
    let receipt = InstallReceipt {
        name: formula.name().to_string(),
        version: formula.version_str_full(),
        build_hash: request.build_hash.to_string(),
        options: request.options.canonical(),
        platform: request.platform.clone(),
        dependencies: request.dependencies.iter().map(|d| d.name.clone()).collect(),
        source_url: formula.source.url.clone(),
        source_sha256: formula.source.sha256.clone(),
    };
    write_json_sync(&keg.join(RECEIPT_FILENAME), &receipt)?;
    debug!(
        "Installed {} files for {} into {}",
        layout.file_count(),
        formula.name(),
        keg.display()
    );
    Ok(layout)
}

/// Where the installable tree lives inside the staging directory.
///
/// `<staging>/<keg>` when the build honored `DESTDIR`; otherwise the single
/// non-standard top-level directory if there is one, else the staging root.
/// A build that ignored `DESTDIR` and wrote straight into a fresh keg has
/// its output moved into staging first. A keg holding a receipt belongs to an
/// earlier install and is never taken as this build's output.
fn content_root(formula: &str, staging: &Path, keg: &Path) -> Result<PathBuf> {
    let relative_keg: PathBuf = keg
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    let nested = staging.join(&relative_keg);
    if nested.is_dir() {
        debug!("Using DESTDIR content root {}", nested.display());
        return Ok(nested);
    }

    if is_empty_dir(staging)? {
        let previous_install = keg.join(RECEIPT_FILENAME).exists();
        if previous_install || !keg.is_dir() || is_empty_dir(keg)? {
            let err = HopsError::InstallError(format!(
                "{}: build produced no output in {}",
                formula,
                staging.display()
            ));
            error!("{}", err);
            return Err(err);
        }
        warn!(
            "Build wrote directly into {}; moving its output to staging",
            keg.display()
        );
        if let Some(parent) = nested.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(keg, &nested).is_err() {
            copy_dir_recursive(keg, &nested)?;
        }
        return Ok(nested);
    }

    let mut subdirs = Vec::new();
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        if !entry.file_type()?.is_dir() {
            debug!("Top-level file '{}' in staging; using staging root", name);
            return Ok(staging.to_path_buf());
        }
        subdirs.push((entry.path(), name));
    }
    match subdirs.as_slice() {
        [(path, name)] if !STANDARD_KEG_DIRS.contains(&name.as_str()) => {
            debug!("Using single intermediate directory {}", path.display());
            Ok(path.clone())
        }
        _ => Ok(staging.to_path_buf()),
    }
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

fn apply_rule(formula: &str, rule: &InstallRule, content_root: &Path, keg: &Path) -> Result<()> {
    let mut dest_dir = keg.join(rule.into.relative_dir(formula));
    if let Some(subdir) = &rule.subdir {
        dest_dir.push(subdir);
    }
    let pattern = content_root.join(&rule.from);
    let pattern = pattern.to_string_lossy();
    let mut matches: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| HopsError::malformed(formula, format!("bad install pattern '{}': {e}", rule.from)))?
        .filter_map(|m| match m {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("Skipping unreadable match for '{}': {}", rule.from, e);
                None
            }
        })
        .collect();
    matches.sort();
    if matches.is_empty() {
        warn!("{}: install rule '{}' matched nothing", formula, rule.from);
        return Ok(());
    }
    fs::create_dir_all(&dest_dir)?;
    for path in matches {
        let Some(name) = path.file_name() else {
            continue;
        };
        copy_entry(&path, &dest_dir.join(name))?;
    }
    Ok(())
}

/// Replaces a symlinked directory by a real one holding a copy of what the
/// link pointed at.
fn make_real_dir(path: &Path) -> Result<()> {
    let is_link = fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    if !is_link {
        fs::create_dir_all(path)?;
        return Ok(());
    }
    let resolved = fs::canonicalize(path).ok().filter(|p| p.is_dir());
    remove_path(path)?;
    fs::create_dir_all(path)?;
    if let Some(source) = resolved {
        debug!("Copying {} into real directory {}", source.display(), path.display());
        copy_dir_recursive(&source, path)?;
    }
    Ok(())
}

fn create_link(keg: &Path, link: &str, target: &str) -> Result<LinkRecord> {
    let link_path = keg.join(link);
    let absolute = if Path::new(target).is_absolute() {
        PathBuf::from(target)
    } else {
        keg.join(target)
    };
    let link_dir = link_path.parent().unwrap_or(keg);
    let target_path = if absolute.starts_with(keg) {
        relative_path(link_dir, &absolute)
    } else {
        absolute.clone()
    };
    if !absolute.exists() {
        warn!("Link target {} does not exist", absolute.display());
    }
    replace_symlink(&target_path, &link_path)?;
    Ok(LinkRecord {
        link: PathBuf::from(link),
        target: target_path,
    })
}

pub(crate) fn shim_script(target: &str, env: &BTreeMap<String, String>) -> String {
    let quote = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"");
    let mut script = String::from("#!/bin/sh\n");
    for (key, value) in env {
        script.push_str(&format!("export {key}=\"{}\"\n", quote(value)));
    }
    script.push_str(&format!("exec \"{}\" \"$@\"\n", quote(target)));
    script
}

fn write_shim(path: &Path, target: &str, env: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_path(path)?;
    fs::write(path, shim_script(target, env))?;
    set_permissions(path, 0o755)?;
    debug!("Wrote shim {} -> {}", path.display(), target);
    Ok(())
}

fn scan_keg(keg: &Path) -> Result<BTreeMap<Category, Vec<PathBuf>>> {
    let mut entries: BTreeMap<Category, Vec<PathBuf>> = BTreeMap::new();
    for entry in WalkDir::new(keg).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| HopsError::InstallError(format!("cannot scan keg: {e}")))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(keg) else {
            continue;
        };
        if relative == Path::new(MANIFEST_FILENAME) || relative == Path::new(RECEIPT_FILENAME) {
            continue;
        }
        entries
            .entry(Category::classify(relative))
            .or_default()
            .push(relative.to_path_buf());
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use hops_common::model::options::OptionSelection;
    use hops_common::model::platform::{Compiler, CompilerFamily, ToolVersion};

    use super::*;

    const SHA: &str = "15d8ee925866f477f4fb62964a1ea6a15796e9c7db676d786928495249078df3";

    fn formula(install: &str) -> Formula {
        Formula::from_json_str(&format!(
            r#"{{"name": "madlib", "version": "1.8", "revision": 1,
                "source": {{"url": "https://github.com/madlib/madlib/archive/v1.8.tar.gz", "sha256": "{SHA}"}},
                "install": {install}}}"#
        ))
        .unwrap()
    }

    fn platform() -> Platform {
        Platform::host(Compiler {
            family: CompilerFamily::Clang,
            version: ToolVersion::parse("7.0.0").unwrap(),
        })
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        staging: PathBuf,
        keg: PathBuf,
        opt: PathBuf,
        prefix: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let prefix = tmp.path().join("hops");
        Fixture {
            staging: tmp.path().join("stage"),
            keg: prefix.join("Cellar/madlib/1.8_1"),
            opt: prefix.join("opt/madlib"),
            prefix,
            _tmp: tmp,
        }
    }

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn run(fx: &Fixture, formula: &Formula) -> Result<InstallationLayout> {
        let options = formula.resolve_options(&OptionSelection::default()).unwrap();
        let platform = platform();
        materialize(&MaterializeRequest {
            formula,
            options: &options,
            platform: &platform,
            staging: &fx.staging,
            keg: &fx.keg,
            opt: &fx.opt,
            hops_prefix: &fx.prefix,
            dependencies: &[],
            build_hash: "abc",
        })
    }

    fn snapshot(dir: &Path) -> Vec<(PathBuf, String)> {
        WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_path_buf();
                let content = if e.path_is_symlink() {
                    format!("-> {}", fs::read_link(e.path()).unwrap().display())
                } else if e.file_type().is_file() {
                    fs::read_to_string(e.path()).unwrap()
                } else {
                    "<dir>".to_string()
                };
                (rel, content)
            })
            .collect()
    }

    #[test]
    fn destdir_output_is_copied_and_recorded() {
        let fx = fixture();
        let nested = fx.staging.join(fx.keg.strip_prefix("/").unwrap());
        write(&nested.join("bin/madpack"), "#!/bin/sh\n");
        write(&nested.join("share/doc/madlib/README"), "docs");

        let layout = run(&fx, &formula("{}")).unwrap();
        assert_eq!(layout.entries[&Category::Bin], vec![PathBuf::from("bin/madpack")]);
        assert_eq!(
            layout.entries[&Category::Doc],
            vec![PathBuf::from("share/doc/madlib/README")]
        );
        assert!(fx.keg.join(RECEIPT_FILENAME).is_file());
        assert_eq!(fs::read_link(&fx.opt).unwrap(), fx.keg);
        assert_eq!(InstallationLayout::load(&fx.keg).unwrap(), layout);
    }

    #[test]
    fn rerunning_yields_identical_keg() {
        let fx = fixture();
        write(&fx.staging.join("madlib-1.8/bin/madpack"), "#!/bin/sh\necho madpack\n");
        write(&fx.staging.join("madlib-1.8/lib/libmadlib.so"), "elf");
        let f = formula(
            r#"{"links": [{"link": "lib/libmadlib.dylib", "target": "{lib}/libmadlib.so"}],
                "shims": [{"path": "libexec/madpack", "target": "{prefix}/bin/madpack",
                           "env": {"PYTHONPATH": "{prefix}/lib/python:$PYTHONPATH"}}]}"#,
        );

        let first = run(&fx, &f).unwrap();
        let before = snapshot(&fx.keg);
        let second = run(&fx, &f).unwrap();
        assert_eq!(first, second);
        assert_eq!(before, snapshot(&fx.keg));
        assert_eq!(
            fs::read_link(fx.keg.join("lib/libmadlib.dylib")).unwrap(),
            PathBuf::from("libmadlib.so")
        );
    }

    #[test]
    fn rules_and_real_dirs() {
        let fx = fixture();
        write(&fx.staging.join("usr/local/lib/plr.so"), "so");
        write(
            &fx.staging.join("usr/local/share/postgresql/extension/plr.control"),
            "control",
        );
        write(&fx.staging.join("usr/local/Versions/1.8/bin/madpack"), "py");
        symlink("Versions/1.8", fx.staging.join("usr/local/Current")).unwrap();
        symlink("Current/bin", fx.staging.join("usr/local/bin")).unwrap();

        let f = formula(
            r#"{"rules": [
                   {"from": "**/lib/*", "into": "lib"},
                   {"from": "**/share/postgresql/extension/*", "into": "share", "subdir": "postgresql/extension"},
                   {"from": "local/Versions", "into": "prefix"},
                   {"from": "local/Current", "into": "prefix"},
                   {"from": "local/bin", "into": "prefix"}],
                "real_dirs": ["bin"],
                "shims": [{"path": "bin/madpack-shim", "target": "{prefix}/Current/bin/madpack"}]}"#,
        );
        let layout = run(&fx, &f).unwrap();
        assert!(fx.keg.join("lib/plr.so").is_file());
        assert!(fx
            .keg
            .join("share/postgresql/extension/plr.control")
            .is_file());
        let bin_meta = fs::symlink_metadata(fx.keg.join("bin")).unwrap();
        assert!(bin_meta.is_dir() && !bin_meta.file_type().is_symlink());
        assert!(fx.keg.join("bin/madpack").is_file());

        let shim = fs::read_to_string(fx.keg.join("bin/madpack-shim")).unwrap();
        assert_eq!(
            shim,
            format!("#!/bin/sh\nexec \"{}/Current/bin/madpack\" \"$@\"\n", fx.keg.display())
        );
        assert!(hops_aio::fs::is_executable(&fx.keg.join("bin/madpack-shim")));
        assert_eq!(layout.shims, vec![PathBuf::from("bin/madpack-shim")]);
    }

    #[test]
    fn empty_staging_never_reuses_a_previous_install() {
        let fx = fixture();
        fs::create_dir_all(&fx.staging).unwrap();
        let f = formula("{}");
        write(&fx.staging.join("bin/madpack"), "#!/bin/sh\n");
        run(&fx, &f).unwrap();
        fs::remove_dir_all(&fx.staging).unwrap();
        fs::create_dir_all(&fx.staging).unwrap();
        write(&fx.keg.join("bin/old-tool"), "#!/bin/sh\n");

        match run(&fx, &f) {
            Err(HopsError::InstallError(msg)) => assert!(msg.contains("no output")),
            other => panic!("expected an install error, got {other:?}"),
        }
        assert!(fx.keg.join("bin/old-tool").is_file());
        assert!(fx.keg.join(RECEIPT_FILENAME).is_file());
        assert!(is_empty_dir(&fx.staging).unwrap());
    }

    #[test]
    fn output_written_into_a_fresh_keg_is_picked_up() {
        let fx = fixture();
        fs::create_dir_all(&fx.staging).unwrap();
        write(&fx.keg.join("bin/madpack"), "#!/bin/sh\n");

        let layout = run(&fx, &formula("{}")).unwrap();
        assert_eq!(layout.entries[&Category::Bin], vec![PathBuf::from("bin/madpack")]);
        assert!(fx.keg.join(RECEIPT_FILENAME).is_file());
    }

    #[test]
    fn empty_staging_without_a_keg_is_an_error() {
        let fx = fixture();
        fs::create_dir_all(&fx.staging).unwrap();
        assert!(matches!(
            run(&fx, &formula("{}")),
            Err(HopsError::InstallError(_))
        ));
        assert!(!fx.keg.exists());
    }

    #[test]
    fn missing_entry_point_is_an_error() {
        let fx = fixture();
        write(&fx.staging.join("share/doc/README"), "only docs");
        write(&fx.staging.join("include/x.h"), "");
        let err = run(&fx, &formula("{}")).unwrap_err();
        assert!(matches!(err, HopsError::InstallError(_)));
        assert!(!fx.keg.join(RECEIPT_FILENAME).exists());
    }

    #[test]
    fn shim_exports_are_sorted_and_quoted() {
        let env = BTreeMap::from([
            ("QGIS_PREFIX_PATH".to_string(), "/opt/qgis".to_string()),
            ("GDAL_DATA".to_string(), "say \"hi\"".to_string()),
        ]);
        assert_eq!(
            shim_script("/opt/qgis/bin/qgis", &env),
            "#!/bin/sh\nexport GDAL_DATA=\"say \\\"hi\\\"\"\nexport QGIS_PREFIX_PATH=\"/opt/qgis\"\nexec \"/opt/qgis/bin/qgis\" \"$@\"\n"
        );
    }
}
